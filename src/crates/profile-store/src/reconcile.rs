//! Filling missing payload keys from a template

use serde_json::Value;

/// Recursively copy into `target` every key of `template` that `target`
/// lacks (or holds as `null`).
///
/// Keys already present are never overwritten, nested objects present on
/// both sides are merged key by key, and keys missing from the template are
/// left alone. Applying it twice gives the same result as applying it once.
pub fn reconcile(target: &mut Value, template: &Value) {
    let (Value::Object(target), Value::Object(template)) = (target, template) else {
        return;
    };

    for (key, default) in template {
        if matches!(target.get(key), None | Some(Value::Null)) {
            target.insert(key.clone(), default.clone());
            continue;
        }
        if let Some(existing) = target.get_mut(key) {
            if existing.is_object() && default.is_object() {
                reconcile(existing, default);
            }
        }
    }
}
