use std::fs;
use std::path::Path;

use crate::prelude::*;
use crate::symbols::SymbolRegistry;

/// Parse a `System.map` file and feed it into the registry.
///
/// Lines are `<hex-address> <one-letter-mode> <name>`; an upper-case mode
/// letter marks a global symbol, lower-case a private one.
pub fn parse_system_map(path: &Path, registry: &SymbolRegistry) -> Result<usize> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to open System.map at '{}'", path.display()))?;

    let mut count = 0;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(mode), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(address) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        let private = mode.chars().next().is_some_and(|c| c.is_lowercase());
        registry.add_sysmap_symbol(name, address, private);
        count += 1;
    }

    Ok(count)
}
