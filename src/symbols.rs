use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Name/address maps shared by every loader of one kernel (or one process).
///
/// Registrations happen during the load phase, possibly from several module
/// loader threads at once; the internal lock serialises them. After all
/// loaders finished, `update_reverse_maps` freezes the address→name view the
/// comparator queries.
pub struct SymbolRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// global symbols: ELF symbol tables + upper-case System.map entries
    symbols: HashMap<String, u64>,
    /// lower-case System.map entries
    private: HashMap<String, u64>,
    /// function symbols, locals uniquified with `@@<scope>`
    functions: HashMap<String, u64>,

    rev_symbols: BTreeMap<u64, String>,
    rev_functions: BTreeMap<u64, String>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        SymbolRegistry {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add_symbol(&self, name: &str, address: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.symbols.insert(name.to_string(), address);
    }

    pub fn add_function(&self, name: &str, address: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.functions.insert(name.to_string(), address);
    }

    pub fn add_sysmap_symbol(&self, name: &str, address: u64, private: bool) {
        let mut inner = self.inner.lock().unwrap();
        if private {
            inner.private.insert(name.to_string(), address);
        } else {
            inner.symbols.insert(name.to_string(), address);
        }
    }

    /// Global map lookup, falling back to the private System.map entries.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .symbols
            .get(name)
            .or_else(|| inner.private.get(name))
            .copied()
    }

    /// Global map only (upper-case System.map and exported symbols).
    pub fn sysmap_address(&self, name: &str) -> Option<u64> {
        self.inner.lock().unwrap().symbols.get(name).copied()
    }

    pub fn private_address(&self, name: &str) -> Option<u64> {
        self.inner.lock().unwrap().private.get(name).copied()
    }

    pub fn function_address(&self, name: &str) -> Option<u64> {
        self.inner.lock().unwrap().functions.get(name).copied()
    }

    /// Rebuild the reverse maps. Called exactly once, after every module
    /// loader thread has joined and before any comparison starts.
    pub fn update_reverse_maps(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rev_symbols = inner
            .symbols
            .iter()
            .map(|(name, &addr)| (addr, name.clone()))
            .collect();
        inner.rev_functions = inner
            .functions
            .iter()
            .map(|(name, &addr)| (addr, name.clone()))
            .collect();
    }

    pub fn is_symbol(&self, address: u64) -> bool {
        self.inner.lock().unwrap().rev_symbols.contains_key(&address)
    }

    pub fn is_function(&self, address: u64) -> bool {
        self.inner.lock().unwrap().rev_functions.contains_key(&address)
    }

    /// Start address of the function containing `address` (the closest
    /// function entry at or below it).
    pub fn containing_function(&self, address: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .rev_functions
            .range(..=address)
            .next_back()
            .map(|(&addr, _)| addr)
    }

    pub fn function_name(&self, address: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.rev_functions.get(&address).cloned()
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope suffix for local symbols: `kernel` for the kernel binary, the
/// module basename for modules, the pid for userspace.
pub fn scoped_local_name(name: &str, scope: &str) -> String {
    format!("{name}@@{scope}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_entries_are_fallback_only() {
        let registry = SymbolRegistry::new();
        registry.add_sysmap_symbol("jiffies", 0xffffffff81c05000, false);
        registry.add_sysmap_symbol("tsc_khz", 0xffffffff81c4b520, true);

        assert_eq!(registry.symbol_address("jiffies"), Some(0xffffffff81c05000));
        assert_eq!(registry.symbol_address("tsc_khz"), Some(0xffffffff81c4b520));
        assert_eq!(registry.sysmap_address("tsc_khz"), None);
    }

    #[test]
    fn local_scoping_avoids_collisions() {
        let registry = SymbolRegistry::new();
        registry.add_function(&scoped_local_name("probe", "e1000"), 0xffffffffa0001000);
        registry.add_function(&scoped_local_name("probe", "igb"), 0xffffffffa0100000);

        assert_eq!(
            registry.function_address("probe@@e1000"),
            Some(0xffffffffa0001000)
        );
        assert_eq!(
            registry.function_address("probe@@igb"),
            Some(0xffffffffa0100000)
        );
    }

    #[test]
    fn reverse_maps_answer_containment_queries() {
        let registry = SymbolRegistry::new();
        registry.add_function("__schedule", 0xffffffff816d4000);
        registry.add_function("kthread", 0xffffffff816d5000);
        registry.update_reverse_maps();

        assert!(registry.is_function(0xffffffff816d4000));
        assert!(!registry.is_function(0xffffffff816d4001));
        assert_eq!(
            registry.containing_function(0xffffffff816d4123),
            Some(0xffffffff816d4000)
        );
        assert_eq!(
            registry.containing_function(0xffffffff816d5fff),
            Some(0xffffffff816d5000)
        );
        assert_eq!(registry.containing_function(0xffffffff816d3fff), None);
    }
}
