//! Kernel-side state: the trusted kernel image, its symbol registry, the
//! module map and the concurrent module load phase.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::elf::{ElfImage, sysmap};
use crate::guest::types::{Instance, TypeOracle};
use crate::guest::{GuestMemory, KERNEL_SPACE};
use crate::loader::kernel::{
    KernelAddresses, build_kernel_loader, kernel_addresses, register_kernel_symbols,
};
use crate::loader::module::{ModulePlacement, build_module_loader, modinfo_depends};
use crate::loader::Loader;
use crate::patch::PatchContext;
use crate::prelude::*;
use crate::reloc::SymbolResolver;
use crate::symbols::SymbolRegistry;

enum ModuleSlot {
    /// claimed by a worker, load in progress
    Loading,
    Ready(Arc<Loader>),
    Failed,
}

pub struct Kernel {
    pub memory: Arc<dyn GuestMemory>,
    pub types: Arc<dyn TypeOracle>,
    pub registry: SymbolRegistry,
    pub ctx: PatchContext,
    pub loader: Loader,
    pub addrs: KernelAddresses,

    modules: Mutex<HashMap<String, ModuleSlot>>,
    module_files: HashMap<String, PathBuf>,
    module_instances: HashMap<String, u64>,
}

/// Hyphens and underscores are interchangeable in module names.
pub fn canonical_module_name(name: &str) -> String {
    name.replace('-', "_")
}

impl Kernel {
    /// Load the trusted kernel binary and System.map from `kernel_dir`,
    /// index the module tree, and reconstruct the kernel image.
    pub fn load(
        kernel_dir: &Path,
        module_dir: &Path,
        memory: Arc<dyn GuestMemory>,
        types: Arc<dyn TypeOracle>,
    ) -> Result<Self> {
        let vmlinux = kernel_dir.join("vmlinux");
        let image = ElfImage::open(&vmlinux)?;
        info!("loaded kernel image {}", image.path().display());

        let registry = SymbolRegistry::new();
        let entries = sysmap::parse_system_map(&kernel_dir.join("System.map"), &registry)?;
        debug!("System.map: {entries} entries");

        let ctx = PatchContext::load(types.as_ref(), memory.as_ref())?;

        let text_base = image.section_by_name(".text")?.addr;
        register_kernel_symbols(&image, &registry, text_base)?;
        let addrs = kernel_addresses(&image, &registry);

        let loader = build_kernel_loader(image, &ctx, types.as_ref(), memory.as_ref())?;

        let leftover = crate::loader::kernel::count_fentry_calls(&loader.text, addrs.fentry);
        if leftover > 0 {
            warn!("{leftover} unpatched __fentry__ calls remain in the kernel text");
        }

        let module_files = index_module_files(module_dir)?;
        debug!("module tree: {} candidate files", module_files.len());

        let mut kernel = Kernel {
            memory,
            types,
            registry,
            ctx,
            loader,
            addrs,
            modules: Mutex::new(HashMap::new()),
            module_files,
            module_instances: HashMap::new(),
        };
        kernel.module_instances = kernel.read_guest_module_list()?;
        Ok(kernel)
    }

    /// The names of the modules currently loaded in the guest.
    pub fn guest_module_names(&self) -> Vec<String> {
        self.module_instances.keys().cloned().collect()
    }

    /// Walk the guest's `modules` list; name -> `struct module` address.
    fn read_guest_module_list(&self) -> Result<HashMap<String, u64>> {
        let oracle = self.types.as_ref();
        let memory = self.memory.as_ref();

        let module_layout = oracle.base_type("module")?;
        let list_offset = module_layout.member_offset("list")?;

        let modules_head = oracle.variable("modules")?;
        let mut instances = HashMap::new();

        let mut next = memory.read_u64(modules_head.address, KERNEL_SPACE)?;
        let mut guard = 0u32;
        while next != modules_head.address {
            let module_addr = next - list_offset;
            let module = oracle.instance_at("module", module_addr)?;
            let name_member =
                module.member(oracle, memory, KERNEL_SPACE, "name", false)?;
            let name = memory.read_cstr(name_member.address, 64, KERNEL_SPACE)?;
            instances.insert(canonical_module_name(&name), module_addr);

            next = memory.read_u64(next, KERNEL_SPACE)?;
            guard += 1;
            if guard > 0x4000 {
                bail!("guest module list does not terminate");
            }
        }
        Ok(instances)
    }

    pub fn module_file(&self, name: &str) -> Option<&PathBuf> {
        self.module_files.get(&canonical_module_name(name))
    }

    /// Load every guest module, one worker per hardware thread, each
    /// drawing the next name from a shared queue. A per-module failure is
    /// reported and the rest continue; an invariant violation aborts.
    pub fn load_all_modules(&self) -> Result<usize> {
        let names = self.guest_module_names();
        let queue = Mutex::new(names.into_iter().collect::<VecDeque<_>>());
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let internal_error = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(name) = queue.lock().unwrap().pop_front() else {
                            return;
                        };
                        if let Err(err) = self.load_module(&name) {
                            error!("module {name}: {err:#}");
                            if matches!(
                                err.downcast_ref::<crate::error::VerifyError>(),
                                Some(crate::error::VerifyError::InternalError(_))
                            ) {
                                internal_error.lock().unwrap().replace(err);
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = internal_error.into_inner().unwrap() {
            return Err(err);
        }

        self.registry.update_reverse_maps();

        let modules = self.modules.lock().unwrap();
        let failed = modules
            .values()
            .filter(|slot| !matches!(slot, ModuleSlot::Ready(_)))
            .count();
        if failed > 0 {
            warn!("{failed} modules failed to load");
        }
        Ok(modules.len() - failed)
    }

    /// Load one module (and, recursively, its dependencies). Concurrent
    /// callers of the same name coordinate through the in-flight slot: the
    /// first claims it, the rest spin until it resolves.
    pub fn load_module(&self, name: &str) -> Result<Arc<Loader>> {
        let name = canonical_module_name(name);

        loop {
            let mut modules = self.modules.lock().unwrap();
            match modules.get(&name) {
                Some(ModuleSlot::Ready(loader)) => return Ok(loader.clone()),
                Some(ModuleSlot::Failed) => bail!("module {name} previously failed to load"),
                Some(ModuleSlot::Loading) => {
                    drop(modules);
                    std::thread::yield_now();
                    continue;
                }
                None => {
                    modules.insert(name.clone(), ModuleSlot::Loading);
                    break;
                }
            }
        }

        match self.load_module_inner(&name) {
            Ok(loader) => {
                let loader = Arc::new(loader);
                self.modules
                    .lock()
                    .unwrap()
                    .insert(name, ModuleSlot::Ready(loader.clone()));
                Ok(loader)
            }
            Err(err) => {
                self.modules
                    .lock()
                    .unwrap()
                    .insert(name.clone(), ModuleSlot::Failed);
                Err(err.context(format!("loading module {name}")))
            }
        }
    }

    fn load_module_inner(&self, name: &str) -> Result<Loader> {
        let path = self
            .module_file(name)
            .ok_or_else(|| anyhow!("no .ko file found for module {name}"))?;
        debug!("loading module {name} from {}", path.display());
        let image = ElfImage::open(path)?;

        for dep in modinfo_depends(&image) {
            self.load_module(&dep)
                .with_context(|| format!("dependency {dep} of {name}"))?;
        }

        let placement = self.module_placement(name, &image)?;
        let resolver = KernelSymbolResolver { kernel: self };

        build_module_loader(
            image,
            name,
            &placement,
            &resolver,
            &self.ctx,
            self.types.as_ref(),
            self.memory.as_ref(),
            &self.registry,
        )
    }

    /// Section placement from the guest's `struct module`: the
    /// `sect_attrs` list, `.bss` right after the module struct, the GPL
    /// symbol table from `gpl_syms`, the per-cpu area from `percpu`.
    fn module_placement(&self, name: &str, image: &ElfImage) -> Result<ModulePlacement> {
        let oracle = self.types.as_ref();
        let memory = self.memory.as_ref();

        let &module_addr = self
            .module_instances
            .get(&canonical_module_name(name))
            .ok_or_else(|| anyhow!("module {name} is not loaded in the guest"))?;
        let module = oracle.instance_at("module", module_addr)?;

        let mut placement = ModulePlacement::default();

        let attrs = module.member(oracle, memory, KERNEL_SPACE, "sect_attrs", true)?;
        let count = attrs
            .member(oracle, memory, KERNEL_SPACE, "nsections", false)?
            .value_u32(memory, KERNEL_SPACE)?;
        let attr_array = attrs.member(oracle, memory, KERNEL_SPACE, "attrs", false)?;
        for i in 0..count {
            let attr = attr_array.array_elem(oracle, u64::from(i))?;
            let name_ptr = attr
                .member(oracle, memory, KERNEL_SPACE, "name", false)?
                .value_u64(memory, KERNEL_SPACE)?;
            let section_name = memory.read_cstr(name_ptr, 64, KERNEL_SPACE)?;
            let address = attr
                .member(oracle, memory, KERNEL_SPACE, "address", false)?
                .value_u64(memory, KERNEL_SPACE)?;
            placement.section_addrs.insert(section_name, address);
        }

        if !placement.section_addrs.contains_key("__ksymtab_gpl") {
            if let Ok(gpl) = module.member(oracle, memory, KERNEL_SPACE, "gpl_syms", false) {
                placement
                    .section_addrs
                    .insert("__ksymtab_gpl".into(), gpl.value_u64(memory, KERNEL_SPACE)?);
            }
        }

        if !placement.section_addrs.contains_key(".bss") {
            let align = image
                .section_by_name(".bss")
                .map(|s| s.align.max(1))
                .unwrap_or(8);
            if let Some(addr) = self.bss_placement(&module, align)? {
                placement.section_addrs.insert(".bss".into(), addr);
            }
        }

        if let Ok(percpu) = module.member(oracle, memory, KERNEL_SPACE, "percpu", false) {
            let base = percpu.value_u64(memory, KERNEL_SPACE)?;
            if base != 0 {
                placement.percpu_base = Some(base);
            }
        }

        Ok(placement)
    }

    /// `.bss` sits directly after the module struct, aligned up.
    fn bss_placement(&self, module: &Instance, align: u64) -> Result<Option<u64>> {
        let Some(layout) = module.layout() else {
            return Ok(None);
        };
        let size = layout.size.next_multiple_of(align);
        Ok(Some(module.address + size))
    }

    pub fn module_loaders(&self) -> Vec<(String, Arc<Loader>)> {
        let modules = self.modules.lock().unwrap();
        modules
            .iter()
            .filter_map(|(name, slot)| match slot {
                ModuleSlot::Ready(loader) => Some((name.clone(), loader.clone())),
                _ => None,
            })
            .collect()
    }

    /// The loader (kernel or module) owning an address, if any.
    pub fn loader_for_address(&self, vaddr: u64) -> Option<KernelSpaceLoader> {
        if self.loader.contains_address(vaddr) {
            return Some(KernelSpaceLoader::Kernel);
        }
        let modules = self.modules.lock().unwrap();
        for (name, slot) in modules.iter() {
            if let ModuleSlot::Ready(loader) = slot {
                if loader.contains_address(vaddr) {
                    return Some(KernelSpaceLoader::Module(name.clone(), loader.clone()));
                }
            }
        }
        None
    }

    pub fn resolve_symbol(&self, name: &str) -> Result<u64> {
        let resolver = KernelSymbolResolver { kernel: self };
        resolver.resolve(name)
    }
}

/// A comparator-side handle onto the owning loader of a page.
pub enum KernelSpaceLoader {
    Kernel,
    Module(String, Arc<Loader>),
}

/// Undefined module symbols resolve against System.map first, then the
/// registry's exported symbols and functions, then the debug information.
struct KernelSymbolResolver<'a> {
    kernel: &'a Kernel,
}

impl SymbolResolver for KernelSymbolResolver<'_> {
    fn resolve(&self, name: &str) -> Result<u64> {
        let kernel = self.kernel;
        if let Some(addr) = kernel.registry.sysmap_address(name) {
            return Ok(addr);
        }
        if let Some(addr) = kernel.registry.symbol_address(name) {
            return Ok(addr);
        }
        if let Some(addr) = kernel.registry.function_address(name) {
            return Ok(addr);
        }
        if let Ok(variable) = kernel.types.variable(name) {
            return Ok(variable.address);
        }
        if let Some(addr) = kernel.types.function_address(name) {
            return Ok(addr);
        }
        bail!("symbol {name} not known to the kernel")
    }
}

/// Recursively index `<name>.ko` files under the module tree, keyed by
/// canonical module name. Anything under a `debian` directory is packaging
/// debris, not a loadable module.
pub fn index_module_files(dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut files = HashMap::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot read {}: {err}", current.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().is_some_and(|n| n == "debian") {
                    continue;
                }
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "ko") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    files
                        .entry(canonical_module_name(stem))
                        .or_insert(path);
                }
            }
        }
    }
    Ok(files)
}
