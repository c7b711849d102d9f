use clap::ValueEnum;

/// When downloaded content is checked against the catalog's SHA-256.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Only when the catalog carries a hash.
    Auto,
    /// Every location must carry a hash.
    On,
    Off,
}
