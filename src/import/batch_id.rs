//! Batch id and batch column resolution.

use crate::model::Model;

/// Column used when neither the import nor the model names one.
pub const DEFAULT_BATCH_ID_FIELD: &str = "last_batch_id";

/// How an import obtains its batch id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BatchIdSetting {
    /// Ask the model's generator, if it has one.
    #[default]
    Auto,
    Disabled,
    Explicit(String),
}

/// Resolve the batch id for one import run. Called once per prepared import.
pub fn resolve_batch_id(setting: &BatchIdSetting, model: &dyn Model) -> Option<String> {
    match setting {
        BatchIdSetting::Disabled => None,
        BatchIdSetting::Explicit(id) => Some(id.clone()),
        BatchIdSetting::Auto => model
            .batch_id_generator()
            .map(|generator| generator.next_batch_id()),
    }
}

/// Explicit override, then the model's batch column, then `last_batch_id`.
pub fn resolve_batch_id_field(explicit: Option<&str>, model: &dyn Model) -> String {
    if let Some(field) = explicit {
        return field.to_string();
    }
    model
        .batch_id_storage()
        .map(|storage| storage.batch_id_field())
        .unwrap_or_else(|| DEFAULT_BATCH_ID_FIELD.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableModel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_priority_of_batch_id_sources() {
        let plain = TableModel::new("t");
        let generating = TableModel::new("t").batch_ids(|| "25".to_string());

        assert_eq!(resolve_batch_id(&BatchIdSetting::Auto, &plain), None);
        assert_eq!(
            resolve_batch_id(&BatchIdSetting::Auto, &generating),
            Some("25".to_string())
        );
        assert_eq!(
            resolve_batch_id(&BatchIdSetting::Explicit("19".into()), &generating),
            Some("19".to_string())
        );
        assert_eq!(resolve_batch_id(&BatchIdSetting::Disabled, &generating), None);
    }

    #[test]
    fn test_generator_invoked_per_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let model = TableModel::new("t").batch_ids(move || {
            (counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        });
        assert_eq!(resolve_batch_id(&BatchIdSetting::Auto, &model), Some("1".into()));
        assert_eq!(resolve_batch_id(&BatchIdSetting::Auto, &model), Some("2".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_batch_field_priority() {
        let plain = TableModel::new("t");
        let storing = TableModel::new("t").batch_id_field("c");
        assert_eq!(resolve_batch_id_field(None, &plain), "last_batch_id");
        assert_eq!(resolve_batch_id_field(None, &storing), "c");
        assert_eq!(resolve_batch_id_field(Some("x"), &storing), "x");
    }
}
