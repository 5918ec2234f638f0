//! Lazy address-to-symbol resolution.
//!
//! Symbolization is deferred to report time: it is orders of magnitude
//! more expensive than the stack walk and may allocate, so it must never
//! run inside the allocation hook.

use std::ffi::c_void;

/// Resolves captured return addresses to human-readable text through the
/// platform symbol service.
///
/// Resolution is best effort and never fails; it degrades through tiers:
/// file:line plus symbol, symbol plus offset, then the raw address. (The
/// portable symbol service exposes no standalone module information, so
/// the module-only tier collapses into the raw-address one.) The backend
/// initializes its symbol state on first use and keeps it for the process
/// lifetime.
pub struct SymbolResolver {
    _private: (),
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Always returns some text for `address`.
    pub fn resolve(&self, address: usize) -> String {
        let mut text: Option<String> = None;

        backtrace::resolve(address as *mut c_void, |symbol| {
            if text.is_some() {
                return;
            }

            let Some(name) = symbol.name() else {
                return;
            };
            let offset = symbol
                .addr()
                .map(|base| address.saturating_sub(base as usize))
                .unwrap_or(0);

            text = Some(match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => format!(
                    "{}:{} - {} + {:#x} [{:#x}]",
                    file.display(),
                    line,
                    name,
                    offset,
                    address
                ),
                _ => format!("{} + {:#x} [{:#x}]", name, offset, address),
            });
        });

        text.unwrap_or_else(|| format!("[{:#x}]", address))
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}
