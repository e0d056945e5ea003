use std::env;

pub(crate) fn env_usize_from(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    lookup(key).and_then(|value| value.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64_from(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Default capacity of the import buffer and of each callback buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 500;

/// Buffer sizing for a batch import.
///
/// Values of zero are accepted here and rejected when the config is applied to
/// a `BatchImport`, so misconfiguration surfaces as an `ImportError::Config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportConfig {
    pub buffer_size: usize,
    pub callback_buffer_size: usize,
}

impl ImportConfig {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            callback_buffer_size: buffer_size,
        }
    }

    pub fn from_env() -> Self {
        Self::from_vars(&env_lookup)
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_vars(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let buffer_size =
            env_usize_from(lookup, "BATCH_IMPORT_BUFFER_SIZE").unwrap_or(DEFAULT_BUFFER_SIZE);
        let callback_buffer_size =
            env_usize_from(lookup, "BATCH_IMPORT_CALLBACK_BUFFER_SIZE").unwrap_or(buffer_size);

        Self {
            buffer_size,
            callback_buffer_size,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
