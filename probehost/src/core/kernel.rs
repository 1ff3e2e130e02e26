//! # Kernel
//!
//! Kernel symbol inspection, used to validate hook targets before attaching
//! handlers to them.

use std::{collections::HashSet, fs};

use anyhow::{anyhow, bail, Result};
use once_cell::sync::OnceCell;

static SYMBOLS: OnceCell<KernelSymbols> = OnceCell::new();

/// Get the kernel symbols singleton, initializing it on first use.
pub(crate) fn symbols() -> Result<&'static KernelSymbols> {
    SYMBOLS.get_or_try_init(KernelSymbols::from_kallsyms)
}

/// Function symbols of the running kernel.
pub(crate) struct KernelSymbols {
    funcs: HashSet<String>,
}

impl KernelSymbols {
    fn from_kallsyms() -> Result<KernelSymbols> {
        Self::parse(&fs::read_to_string("/proc/kallsyms")?)
    }

    /// Parse a kallsyms-formatted symbol list, keeping text symbols only:
    /// probes can only target code.
    fn parse(input: &str) -> Result<KernelSymbols> {
        let mut funcs = HashSet::new();

        for line in input.lines() {
            let data: Vec<&str> = line.split(' ').collect();
            if data.len() < 3 {
                bail!("Invalid kallsyms line: {line}");
            }

            if !matches!(data[1], "t" | "T" | "w" | "W") {
                continue;
            }

            // Module symbols have a trailing "\t[module]" part.
            let symbol = data[2]
                .split('\t')
                .next()
                .ok_or_else(|| anyhow!("Couldn't get symbol name for {}", data[0]))?;
            funcs.insert(symbol.to_string());
        }

        Ok(KernelSymbols { funcs })
    }

    /// Does `symbol` exist as a function in the running kernel?
    pub(crate) fn contains(&self, symbol: &str) -> bool {
        self.funcs.contains(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kallsyms() {
        let syms = KernelSymbols::parse(
            "0000000000000000 A fixed_percpu_data\n\
             ffffffff95000000 T _stext\n\
             ffffffff95001000 T do_one_initcall\n\
             ffffffff95002c80 t kfree_skb_reason\n\
             ffffffff95003000 D vmap_area_lock\n\
             ffffffffc0b24000 t my_module_fn\t[my_module]\n",
        )
        .unwrap();

        assert!(syms.contains("do_one_initcall"));
        assert!(syms.contains("kfree_skb_reason"));
        assert!(syms.contains("my_module_fn"));

        // Data symbols are not probeable.
        assert!(!syms.contains("vmap_area_lock"));
        assert!(!syms.contains("fixed_percpu_data"));
        assert!(!syms.contains("not_a_symbol"));
    }

    #[test]
    fn parse_invalid_line() {
        assert!(KernelSymbols::parse("ffffffff95000000 T\n").is_err());
    }
}
