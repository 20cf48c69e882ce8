use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::elf::ElfImage;
use crate::guest::GuestMemory;
use crate::guest::dump::DumpMemory;
use crate::guest::types::DwarfTypes;
use crate::kernel::Kernel;
use crate::local_logger::init_local_logger;
use crate::prelude::*;
use crate::process::Process;
use crate::validate::{KernelValidator, ProcessValidator, ValidatorOptions};

/// Verify the code integrity of a running guest against its trusted
/// binaries.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Directory containing the trusted `vmlinux` and `System.map`
    pub kernel_dir: PathBuf,

    /// Memory source for the introspection backend (e.g. a dump file)
    pub memory_source: Option<PathBuf>,

    /// Use the KVM introspection channel
    #[arg(short = 'k', long = "kvm", conflicts_with_all = ["xen", "file_dump"])]
    pub kvm: bool,

    /// Use the Xen introspection channel
    #[arg(short = 'x', long = "xen", conflicts_with_all = ["kvm", "file_dump"])]
    pub xen: bool,

    /// Read guest memory from a dump file
    #[arg(short = 'f', long = "file", conflicts_with_all = ["kvm", "xen"])]
    pub file_dump: bool,

    /// Kernel module tree; defaults to the kernel directory
    #[arg(long, env = "GUESTGUARD_MODULE_DIR")]
    pub modules: Option<PathBuf>,

    /// Colon-separated library search path for userspace verification
    #[arg(long, env = "GUESTGUARD_LIBRARY_PATH")]
    pub libs: Option<String>,

    /// Also verify this process
    #[arg(long)]
    pub pid: Option<i32>,

    /// Pre-recorded call graph file (call_addr, call_dest pairs)
    #[arg(long)]
    pub call_targets: Option<PathBuf>,

    /// Keep re-validating in a loop
    #[arg(long = "loop")]
    pub loop_mode: bool,

    /// Skip the byte-level code comparison
    #[arg(long)]
    pub no_code: bool,

    /// Skip data-pointer and stack examination
    #[arg(long)]
    pub no_pointers: bool,

    /// Write a JSON findings report here
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Pick the introspection backend. Only the file dump is carried in-tree;
/// the live channels attach through the same oracle interface.
fn open_memory(cli: &Cli) -> Result<Arc<dyn GuestMemory>> {
    let source = cli.memory_source.as_ref();

    if cli.kvm {
        bail!("no KVM introspection channel is available in this build; use a dump (-f)");
    }
    if cli.xen {
        bail!("no Xen introspection channel is available in this build; use a dump (-f)");
    }

    let Some(path) = source else {
        bail!("no memory source given; pass a dump file");
    };
    if !cli.file_dump && !DumpMemory::looks_like_dump(path) {
        bail!("{} is not a memory dump (auto-detect failed)", path.display());
    }
    Ok(Arc::new(DumpMemory::open(path)?))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_local_logger()?;

    let memory = open_memory(&cli)?;

    info!(
        "parsing debug types from {}",
        cli.kernel_dir.join("vmlinux").display()
    );
    let vmlinux = ElfImage::open(cli.kernel_dir.join("vmlinux"))?;
    let types = Arc::new(DwarfTypes::load(&vmlinux)?);
    drop(vmlinux);

    let module_dir = cli.modules.clone().unwrap_or_else(|| cli.kernel_dir.clone());
    let kernel = Kernel::load(&cli.kernel_dir, &module_dir, memory.clone(), types)?;

    let loaded = kernel.load_all_modules()?;
    info!("{loaded} modules reconstructed");

    let options = ValidatorOptions {
        loop_mode: cli.loop_mode,
        code_validation: !cli.no_code,
        pointer_examination: !cli.no_pointers,
    };
    let mut validator = KernelValidator::new(&kernel, options, cli.call_targets.as_deref())?;
    validator.validate_pages()?;
    validator.report.summarise();

    let mut process_report = None;
    if let Some(pid) = cli.pid {
        let library_path: Vec<PathBuf> = cli
            .libs
            .as_deref()
            .unwrap_or_default()
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect();

        let mut process = Process::load(&kernel, pid, &library_path)?;
        let mut process_validator = ProcessValidator::new(&mut process, memory.as_ref());
        process_validator.validate_mappings()?;
        process_validator.report.summarise();
        process_report = Some(process_validator.report);
    }

    if let Some(path) = &cli.report {
        validator.report.save_to(path)?;
        if let Some(report) = &process_report {
            report.save_to(path.with_extension("process.json"))?;
        }
    }

    Ok(())
}
