use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::core::request::MultiValueMap;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Replaces `{name}` segments in a path template with their configured
/// per-call values. Unmatched placeholders are left in place.
pub(crate) fn substitute_path_params(path: &str, params: &BTreeMap<String, String>) -> String {
    let mut substituted = path.to_owned();
    for (name, value) in params {
        substituted = substituted.replace(&format!("{{{name}}}"), value);
    }
    substituted
}

/// Appends query pairs to a path, preserving any query already present.
pub(crate) fn append_query_pairs(path: &str, query_params: &MultiValueMap) -> String {
    if query_params.is_empty() {
        return path.to_owned();
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, values) in query_params {
        for value in values {
            serializer.append_pair(name, value);
        }
    }
    let encoded = serializer.finish();

    if path.contains('?') {
        format!("{path}&{encoded}")
    } else {
        format!("{path}?{encoded}")
    }
}
