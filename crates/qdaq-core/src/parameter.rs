//! Parameter<T> - Named, validated instrument parameters
//!
//! Every instrument exposes its settings as named parameters with `get()` and
//! `set(value)`. A parameter declares its constraints up front (numeric range or
//! enumerated choices) and rejects out-of-range values with
//! [`QdaqError::Validation`] before the value is stored.
//!
//! Values live in a `tokio::sync::watch` channel so any number of observers can
//! follow changes without polling.
//!
//! ```rust,ignore
//! let slope = Parameter::new("ch01_slope", None::<f64>)
//!     .with_unit("V/s")
//!     .with_description("Ramp slope, null when unbounded");
//!
//! let tc = Parameter::new("time_constant", 0.1)
//!     .with_unit("s")
//!     .with_choices(vec![0.01, 0.03, 0.1, 0.3, 1.0]);
//!
//! tc.set(0.3)?;
//! assert!(tc.set(0.2).is_err());
//!
//! let mut params = ParameterSet::new();
//! params.register(tc.clone());
//! params.get("time_constant").unwrap().set_json(serde_json::json!(1.0))?;
//! assert_eq!(tc.get(), 1.0);
//! ```

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{QdaqError, QdaqResult};

/// Validator callback: returns a human-readable reason on rejection.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Descriptive metadata of a parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Parameter name (unique within its instrument).
    pub name: String,
    /// Axis label for datasets; falls back to the name.
    pub label: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// Physical unit.
    pub unit: Option<String>,
    /// Rejects `set()` when true.
    pub read_only: bool,
    /// Lower bound, when declared.
    #[serde(default)]
    pub min_value: Option<serde_json::Value>,
    /// Upper bound, when declared.
    #[serde(default)]
    pub max_value: Option<serde_json::Value>,
    /// Allowed values, when enumerated.
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
}

struct ParameterShared<T> {
    metadata: ParameterMetadata,
    validators: Vec<Validator<T>>,
}

// =============================================================================
// Parameter<T>
// =============================================================================

/// Typed, observable, validated parameter.
///
/// Clones share state: setting through one clone is visible through all of them,
/// which lets a driver keep a handle while its [`ParameterSet`] exposes another.
pub struct Parameter<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: Arc<watch::Sender<T>>,
    shared: Arc<RwLock<ParameterShared<T>>>,
}

impl<T> Clone for Parameter<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Debug for Parameter<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.shared.read().metadata.name)
            .field("value", &*self.sender.borrow())
            .finish()
    }
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    /// Create a parameter with an initial value.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
            shared: Arc::new(RwLock::new(ParameterShared {
                metadata: ParameterMetadata {
                    name: name.into(),
                    ..Default::default()
                },
                validators: Vec::new(),
            })),
        }
    }

    /// Add a description.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add a physical unit.
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.shared.write().metadata.unit = Some(unit.into());
        self
    }

    /// Add an axis label.
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.shared.write().metadata.label = Some(label.into());
        self
    }

    /// Reject every `set()`.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.shared.write().validators.push(Arc::new(validator));
        self
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Parameter name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Label for datasets, falling back to the name.
    pub fn label(&self) -> String {
        let guard = self.shared.read();
        guard
            .metadata
            .label
            .clone()
            .unwrap_or_else(|| guard.metadata.name.clone())
    }

    /// Unit, empty when undeclared.
    pub fn unit(&self) -> String {
        self.shared.read().metadata.unit.clone().unwrap_or_default()
    }

    /// Metadata snapshot.
    pub fn metadata(&self) -> ParameterMetadata {
        self.shared.read().metadata.clone()
    }

    /// Check a value against read-only state and all constraints.
    pub fn validate(&self, value: &T) -> QdaqResult<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(QdaqError::validation(
                &guard.metadata.name,
                "parameter is read-only",
            ));
        }
        for validator in &guard.validators {
            validator(value).map_err(|reason| QdaqError::validation(&guard.metadata.name, reason))?;
        }
        Ok(())
    }

    /// Validate, store and notify subscribers.
    pub fn set(&self, value: T) -> QdaqResult<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Store without validation. For drivers reflecting hardware state back into
    /// read-only parameters.
    pub fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Follow value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + Debug + PartialOrd + Serialize + 'static,
{
    /// Restrict to the closed interval `[min, max]`.
    ///
    /// Incomparable values (NaN) are rejected as well.
    pub fn with_range(self, min: T, max: T) -> Self {
        {
            let mut guard = self.shared.write();
            guard.metadata.min_value = serde_json::to_value(&min).ok();
            guard.metadata.max_value = serde_json::to_value(&max).ok();
        }
        self.with_validator(move |value: &T| {
            if *value >= min && *value <= max {
                Ok(())
            } else {
                Err(format!("{:?} outside range [{:?}, {:?}]", value, min, max))
            }
        })
    }

    /// Restrict to an enumerated set of values.
    pub fn with_choices(self, choices: Vec<T>) -> Self {
        self.shared.write().metadata.choices = choices
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect();
        self.with_validator(move |value: &T| {
            if choices.iter().any(|c| c == value) {
                Ok(())
            } else {
                Err(format!("{:?} is not one of {:?}", value, choices))
            }
        })
    }
}

// =============================================================================
// Type-erased access
// =============================================================================

/// Type-erased access to a parameter, used by the registry and snapshots.
pub trait ParameterBase: Send + Sync {
    /// Parameter name.
    fn name(&self) -> String;

    /// Current value as JSON.
    fn get_json(&self) -> QdaqResult<serde_json::Value>;

    /// Validate and set from JSON.
    fn set_json(&self, value: serde_json::Value) -> QdaqResult<()>;

    /// Metadata snapshot.
    fn metadata(&self) -> ParameterMetadata;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl<T> ParameterBase for Parameter<T>
where
    T: Clone + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> String {
        Parameter::name(self)
    }

    fn get_json(&self) -> QdaqResult<serde_json::Value> {
        Ok(serde_json::to_value(self.get())?)
    }

    fn set_json(&self, value: serde_json::Value) -> QdaqResult<()> {
        let typed: T = serde_json::from_value(value)
            .map_err(|e| QdaqError::validation(Parameter::name(self), e.to_string()))?;
        self.set(typed)
    }

    fn metadata(&self) -> ParameterMetadata {
        Parameter::metadata(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// ParameterSet
// =============================================================================

/// Named parameters of one instrument.
#[derive(Default)]
pub struct ParameterSet {
    parameters: HashMap<String, Box<dyn ParameterBase>>,
}

impl Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under its own name, replacing any previous one.
    pub fn register<P>(&mut self, parameter: P)
    where
        P: ParameterBase + 'static,
    {
        self.parameters.insert(parameter.name(), Box::new(parameter));
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<&dyn ParameterBase> {
        self.parameters.get(name).map(|p| p.as_ref())
    }

    /// Look up by name with the concrete parameter type.
    pub fn get_typed<T>(&self, name: &str) -> Option<&Parameter<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.parameters
            .get(name)
            .and_then(|p| p.as_any().downcast_ref::<Parameter<T>>())
    }

    /// Set by name from JSON.
    pub fn set_json(&self, name: &str, value: serde_json::Value) -> QdaqResult<()> {
        self.get(name)
            .ok_or_else(|| QdaqError::validation(name, "no such parameter"))?
            .set_json(value)
    }

    /// Sorted parameter names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parameters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate over `(name, parameter)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn ParameterBase)> {
        self.parameters
            .iter()
            .map(|(name, p)| (name.as_str(), p.as_ref()))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// All current values as a JSON object.
    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (name, param) in self.iter() {
            let value = param
                .get_json()
                .unwrap_or_else(|_| serde_json::json!({"error": "serialization_failed"}));
            map.insert(name.to_string(), value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        let p = Parameter::new("voltage", 0.0).with_range(-10.0, 10.0);
        assert!(p.set(5.0).is_ok());
        assert_eq!(p.get(), 5.0);

        let err = p.set(10.5).unwrap_err();
        assert!(matches!(err, QdaqError::Validation { .. }));
        assert_eq!(p.get(), 5.0);
        assert!(p.set(f64::NAN).is_err());
    }

    #[test]
    fn test_choices_validation() {
        let p = Parameter::new("display", "X".to_string())
            .with_choices(vec!["X".to_string(), "R".to_string()]);
        assert!(p.set("R".to_string()).is_ok());
        assert!(p.set("Y".to_string()).is_err());
        assert_eq!(p.metadata().choices.len(), 2);
    }

    #[test]
    fn test_read_only() {
        let p = Parameter::new("idn", "mock".to_string()).read_only();
        assert!(p.set("other".to_string()).is_err());
        p.set_unchecked("other".to_string());
        assert_eq!(p.get(), "other");
    }

    #[test]
    fn test_clones_share_state() {
        let p = Parameter::new("slope", None::<f64>);
        let q = p.clone();
        p.set(Some(0.5)).unwrap();
        assert_eq!(q.get(), Some(0.5));
    }

    #[tokio::test]
    async fn test_subscribe_sees_updates() {
        let p = Parameter::new("level", 1.0);
        let mut rx = p.subscribe();
        p.set(2.0).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2.0);
    }

    #[test]
    fn test_parameter_set_json_access() {
        let tc = Parameter::new("time_constant", 0.1).with_range(0.0, 10.0);
        let mut set = ParameterSet::new();
        set.register(tc.clone());
        set.register(Parameter::new("slope", None::<f64>));

        set.set_json("time_constant", serde_json::json!(0.3)).unwrap();
        assert_eq!(tc.get(), 0.3);
        assert!(set
            .set_json("time_constant", serde_json::json!("fast"))
            .is_err());
        assert!(set.set_json("missing", serde_json::json!(1)).is_err());

        assert_eq!(set.names(), vec!["slope", "time_constant"]);
        assert_eq!(set.snapshot()["slope"], serde_json::Value::Null);
        assert!(set.get_typed::<f64>("time_constant").is_some());
        assert!(set.get_typed::<u32>("time_constant").is_none());
    }
}
