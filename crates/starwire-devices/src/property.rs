/*!
 * Typed property vectors.
 *
 * A property is a named vector of elements of a single kind (switch, number,
 * text, light or blob) owned by one device. Properties are the only state
 * observers ever see: every change a driver makes is published as an update
 * of one vector, and every command a client sends is a partial set of new
 * element values for one vector.
 */
use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// Who may read or write a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Observers may only read
    #[serde(rename = "ro")]
    ReadOnly,
    /// Observers may only write
    #[serde(rename = "wo")]
    WriteOnly,
    /// Observers may read and write
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Permission {
    /// Whether clients may send new values
    pub fn is_writable(&self) -> bool {
        !matches!(self, Permission::ReadOnly)
    }
}

/// Status of a property vector, also used as the value of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyState {
    /// Nothing in progress
    Idle,
    /// Last operation succeeded
    Ok,
    /// Operation in progress
    Busy,
    /// Last operation failed or needs attention
    Alert,
}

impl fmt::Display for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        };
        f.write_str(s)
    }
}

/// State of a single switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchState {
    /// Switch is on
    On,
    /// Switch is off
    Off,
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

/// How many switches of a vector may be on at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchRule {
    /// Exactly one switch is on
    OneOfMany,
    /// Zero or one switch is on
    AtMostOne,
    /// Any number of switches may be on
    #[serde(rename = "AnyOfMany")]
    NOfMany,
}

/// Kind of the elements in a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyKind {
    /// Switch vector
    Switch,
    /// Number vector
    Number,
    /// Text vector
    Text,
    /// Light vector
    Light,
    /// Blob vector
    Blob,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyKind::Switch => "switch",
            PropertyKind::Number => "number",
            PropertyKind::Text => "text",
            PropertyKind::Light => "light",
            PropertyKind::Blob => "blob",
        };
        f.write_str(s)
    }
}

/// A switch element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchElement {
    /// Element name
    pub name: String,
    /// Display label
    pub label: String,
    /// Current state
    pub state: SwitchState,
}

impl SwitchElement {
    /// Create a new switch element
    pub fn new<S: Into<String>, L: Into<String>>(name: S, label: L, state: SwitchState) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            state,
        }
    }
}

/// A number element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberElement {
    /// Element name
    pub name: String,
    /// Display label
    pub label: String,
    /// printf-style display format
    pub format: String,
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Increment hint for clients
    pub step: f64,
    /// Current value
    pub value: f64,
}

impl NumberElement {
    /// Create a new number element
    pub fn new<S: Into<String>, L: Into<String>>(
        name: S,
        label: L,
        value: f64,
        min: f64,
        max: f64,
        step: f64,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            format: "%g".to_string(),
            min,
            max,
            step,
            value,
        }
    }

    /// Set the display format
    pub fn with_format<S: Into<String>>(mut self, format: S) -> Self {
        self.format = format.into();
        self
    }

    fn accepts(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// A text element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    /// Element name
    pub name: String,
    /// Display label
    pub label: String,
    /// Current text
    pub value: String,
}

impl TextElement {
    /// Create a new text element
    pub fn new<S: Into<String>, L: Into<String>, V: Into<String>>(name: S, label: L, value: V) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

/// A light element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightElement {
    /// Element name
    pub name: String,
    /// Display label
    pub label: String,
    /// Current indication
    pub state: PropertyState,
}

impl LightElement {
    /// Create a new light element
    pub fn new<S: Into<String>, L: Into<String>>(name: S, label: L, state: PropertyState) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            state,
        }
    }
}

/// A blob element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobElement {
    /// Element name
    pub name: String,
    /// Display label
    pub label: String,
    /// Format tag, e.g. ".fits" or ".fits.z"
    pub format: String,
    /// Declared (uncompressed) size
    pub size: usize,
    /// Payload as transmitted
    pub data: Bytes,
}

impl BlobElement {
    /// Create a new, empty blob element
    pub fn new<S: Into<String>, L: Into<String>>(name: S, label: L) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            format: String::new(),
            size: 0,
            data: Bytes::new(),
        }
    }
}

/// The elements of a vector, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Elements {
    /// Switch elements and their rule
    Switch {
        /// Rule constraining how many switches are on
        rule: SwitchRule,
        /// Elements in order
        elements: Vec<SwitchElement>,
    },
    /// Number elements
    Number {
        /// Elements in order
        elements: Vec<NumberElement>,
    },
    /// Text elements
    Text {
        /// Elements in order
        elements: Vec<TextElement>,
    },
    /// Light elements
    Light {
        /// Elements in order
        elements: Vec<LightElement>,
    },
    /// Blob elements
    Blob {
        /// Largest accepted declared size, if limited
        #[serde(default, rename = "maxSize", skip_serializing_if = "Option::is_none")]
        max_size: Option<usize>,
        /// Elements in order
        elements: Vec<BlobElement>,
    },
}

impl Elements {
    /// Kind of these elements
    pub fn kind(&self) -> PropertyKind {
        match self {
            Elements::Switch { .. } => PropertyKind::Switch,
            Elements::Number { .. } => PropertyKind::Number,
            Elements::Text { .. } => PropertyKind::Text,
            Elements::Light { .. } => PropertyKind::Light,
            Elements::Blob { .. } => PropertyKind::Blob,
        }
    }

    fn names(&self) -> Vec<&str> {
        match self {
            Elements::Switch { elements, .. } => elements.iter().map(|e| e.name.as_str()).collect(),
            Elements::Number { elements } => elements.iter().map(|e| e.name.as_str()).collect(),
            Elements::Text { elements } => elements.iter().map(|e| e.name.as_str()).collect(),
            Elements::Light { elements } => elements.iter().map(|e| e.name.as_str()).collect(),
            Elements::Blob { elements, .. } => elements.iter().map(|e| e.name.as_str()).collect(),
        }
    }
}

/// A blob value as carried in updates and commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobValue {
    /// Element name
    pub name: String,
    /// Format tag
    pub format: String,
    /// Declared size
    pub size: usize,
    /// Payload
    pub data: Bytes,
}

/// A partial or complete set of element values for one vector
///
/// This is what clients send in commands, what drivers publish in updates and
/// what the configuration store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "camelCase")]
pub enum PropertyValues {
    /// Switch states by element name
    Switch(Vec<(String, SwitchState)>),
    /// Numbers by element name
    Number(Vec<(String, f64)>),
    /// Texts by element name
    Text(Vec<(String, String)>),
    /// Light states by element name
    Light(Vec<(String, PropertyState)>),
    /// Blobs
    Blob(Vec<BlobValue>),
}

impl PropertyValues {
    /// Kind of these values
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValues::Switch(_) => PropertyKind::Switch,
            PropertyValues::Number(_) => PropertyKind::Number,
            PropertyValues::Text(_) => PropertyKind::Text,
            PropertyValues::Light(_) => PropertyKind::Light,
            PropertyValues::Blob(_) => PropertyKind::Blob,
        }
    }

    /// Number of element values carried
    pub fn len(&self) -> usize {
        match self {
            PropertyValues::Switch(v) => v.len(),
            PropertyValues::Number(v) => v.len(),
            PropertyValues::Text(v) => v.len(),
            PropertyValues::Light(v) => v.len(),
            PropertyValues::Blob(v) => v.len(),
        }
    }

    /// Whether no values are carried
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switch element that is requested On, if exactly one is
    pub fn switched_on(&self) -> Option<&str> {
        match self {
            PropertyValues::Switch(v) => {
                let mut on = v.iter().filter(|(_, s)| *s == SwitchState::On);
                match (on.next(), on.next()) {
                    (Some((name, _)), None) => Some(name.as_str()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Number carried for an element
    pub fn number(&self, element: &str) -> Option<f64> {
        match self {
            PropertyValues::Number(v) => v.iter().find(|(n, _)| n == element).map(|(_, x)| *x),
            _ => None,
        }
    }

    /// Text carried for an element
    pub fn text(&self, element: &str) -> Option<&str> {
        match self {
            PropertyValues::Text(v) => v
                .iter()
                .find(|(n, _)| n == element)
                .map(|(_, x)| x.as_str()),
            _ => None,
        }
    }

    /// Light state carried for an element
    pub fn light(&self, element: &str) -> Option<PropertyState> {
        match self {
            PropertyValues::Light(v) => v.iter().find(|(n, _)| n == element).map(|(_, s)| *s),
            _ => None,
        }
    }
}

/// A property vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    device: String,
    name: String,
    label: String,
    group: String,
    permission: Permission,
    state: PropertyState,
    /// Seconds a client should wait for completion before assuming failure
    timeout: f64,
    #[serde(flatten)]
    elements: Elements,
    #[serde(default)]
    revision: u64,
    #[serde(skip)]
    persist: bool,
}

impl Property {
    /// Owning device
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Wire name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Display group
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Permission
    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Current state
    pub fn state(&self) -> PropertyState {
        self.state
    }

    /// Timeout hint in seconds
    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    /// Element kind
    pub fn kind(&self) -> PropertyKind {
        self.elements.kind()
    }

    /// Elements
    pub fn elements(&self) -> &Elements {
        &self.elements
    }

    /// Monotonic revision, incremented on every change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the vector is saved with the device configuration
    pub fn is_persistent(&self) -> bool {
        self.persist
    }

    /// Mark whether the vector is saved with the device configuration
    pub fn set_persistent(&mut self, persist: bool) {
        self.persist = persist;
    }

    /// Set the state without touching values
    pub fn set_state(&mut self, state: PropertyState) {
        self.state = state;
        self.revision += 1;
    }

    /// Snapshot of all element values
    pub fn values(&self) -> PropertyValues {
        match &self.elements {
            Elements::Switch { elements, .. } => PropertyValues::Switch(
                elements.iter().map(|e| (e.name.clone(), e.state)).collect(),
            ),
            Elements::Number { elements } => PropertyValues::Number(
                elements.iter().map(|e| (e.name.clone(), e.value)).collect(),
            ),
            Elements::Text { elements } => PropertyValues::Text(
                elements.iter().map(|e| (e.name.clone(), e.value.clone())).collect(),
            ),
            Elements::Light { elements } => PropertyValues::Light(
                elements.iter().map(|e| (e.name.clone(), e.state)).collect(),
            ),
            Elements::Blob { elements, .. } => PropertyValues::Blob(
                elements
                    .iter()
                    .map(|e| BlobValue {
                        name: e.name.clone(),
                        format: e.format.clone(),
                        size: e.size,
                        data: e.data.clone(),
                    })
                    .collect(),
            ),
        }
    }

    /// State of a switch element
    pub fn switch(&self, element: &str) -> Option<SwitchState> {
        match &self.elements {
            Elements::Switch { elements, .. } => {
                elements.iter().find(|e| e.name == element).map(|e| e.state)
            }
            _ => None,
        }
    }

    /// Name of the first switch that is on
    pub fn first_on(&self) -> Option<&str> {
        match &self.elements {
            Elements::Switch { elements, .. } => elements
                .iter()
                .find(|e| e.state == SwitchState::On)
                .map(|e| e.name.as_str()),
            _ => None,
        }
    }

    /// Value of a number element
    pub fn number(&self, element: &str) -> Option<f64> {
        match &self.elements {
            Elements::Number { elements } => {
                elements.iter().find(|e| e.name == element).map(|e| e.value)
            }
            _ => None,
        }
    }

    /// Value of a text element
    pub fn text(&self, element: &str) -> Option<&str> {
        match &self.elements {
            Elements::Text { elements } => elements
                .iter()
                .find(|e| e.name == element)
                .map(|e| e.value.as_str()),
            _ => None,
        }
    }

    /// Indication of a light element
    pub fn light(&self, element: &str) -> Option<PropertyState> {
        match &self.elements {
            Elements::Light { elements } => {
                elements.iter().find(|e| e.name == element).map(|e| e.state)
            }
            _ => None,
        }
    }

    /// Apply client switch states; see [`Property::apply_values`]
    pub fn apply_switch_states(
        &mut self,
        updates: &[(String, SwitchState)],
        state: PropertyState,
    ) -> Result<()> {
        self.write(&PropertyValues::Switch(updates.to_vec()), state, true)
    }

    /// Apply client numbers; see [`Property::apply_values`]
    pub fn apply_number_values(&mut self, updates: &[(String, f64)], state: PropertyState) -> Result<()> {
        self.write(&PropertyValues::Number(updates.to_vec()), state, true)
    }

    /// Apply client texts; see [`Property::apply_values`]
    pub fn apply_text_values(&mut self, updates: &[(String, String)], state: PropertyState) -> Result<()> {
        self.write(&PropertyValues::Text(updates.to_vec()), state, true)
    }

    /// Apply client blobs; see [`Property::apply_values`]
    pub fn apply_blob_values(&mut self, updates: &[BlobValue], state: PropertyState) -> Result<()> {
        self.write(&PropertyValues::Blob(updates.to_vec()), state, true)
    }

    /// Apply a partial set of values requested by a client
    ///
    /// The update is all-or-nothing: on any error the vector is untouched.
    /// On success the vector takes `state` and its revision is incremented.
    ///
    /// # Errors
    ///
    /// * `PermissionDenied` if the vector is read-only
    /// * `TypeMismatch` if the values are of another kind
    /// * `UnknownElement` for a name the vector does not have
    /// * `InvalidStateTransition` if the switch rule would be violated
    /// * `OutOfRange` for a non-finite or out-of-bounds number, or an oversize blob
    pub fn apply_values(&mut self, values: &PropertyValues, state: PropertyState) -> Result<()> {
        self.write(values, state, true)
    }

    /// Driver-side update, validated like [`Property::apply_values`] but
    /// without the permission check
    pub fn update_values(&mut self, values: &PropertyValues, state: PropertyState) -> Result<()> {
        self.write(values, state, false)
    }

    fn write(&mut self, values: &PropertyValues, state: PropertyState, from_client: bool) -> Result<()> {
        if from_client && !self.permission.is_writable() {
            return Err(DeviceError::PermissionDenied(format!(
                "{}.{} is read-only",
                self.device, self.name
            )));
        }

        let mut elements = self.elements.clone();
        match (&mut elements, values) {
            (Elements::Switch { rule, elements }, PropertyValues::Switch(updates)) => {
                apply_switches(&self.name, *rule, elements, updates)?;
            }
            (Elements::Number { elements }, PropertyValues::Number(updates)) => {
                for (name, value) in updates {
                    let element = elements
                        .iter_mut()
                        .find(|e| &e.name == name)
                        .ok_or_else(|| self.unknown_element(name))?;
                    if !element.accepts(*value) {
                        return Err(DeviceError::OutOfRange {
                            property: self.name.clone(),
                            element: name.clone(),
                            value: *value,
                            min: element.min,
                            max: element.max,
                        });
                    }
                    element.value = *value;
                }
            }
            (Elements::Text { elements }, PropertyValues::Text(updates)) => {
                for (name, value) in updates {
                    let element = elements
                        .iter_mut()
                        .find(|e| &e.name == name)
                        .ok_or_else(|| self.unknown_element(name))?;
                    element.value = value.clone();
                }
            }
            (Elements::Light { elements }, PropertyValues::Light(updates)) => {
                for (name, value) in updates {
                    let element = elements
                        .iter_mut()
                        .find(|e| &e.name == name)
                        .ok_or_else(|| self.unknown_element(name))?;
                    element.state = *value;
                }
            }
            (Elements::Blob { max_size, elements }, PropertyValues::Blob(updates)) => {
                for blob in updates {
                    let element = elements
                        .iter_mut()
                        .find(|e| e.name == blob.name)
                        .ok_or_else(|| self.unknown_element(&blob.name))?;
                    if let Some(limit) = *max_size {
                        if blob.size > limit {
                            return Err(DeviceError::OutOfRange {
                                property: self.name.clone(),
                                element: blob.name.clone(),
                                value: blob.size as f64,
                                min: 0.0,
                                max: limit as f64,
                            });
                        }
                    }
                    element.format = blob.format.clone();
                    element.size = blob.size;
                    element.data = blob.data.clone();
                }
            }
            (elements, values) => {
                return Err(DeviceError::TypeMismatch(
                    self.name.clone(),
                    elements.kind().to_string(),
                    values.kind().to_string(),
                ));
            }
        }

        self.elements = elements;
        self.state = state;
        self.revision += 1;
        Ok(())
    }

    fn unknown_element(&self, element: &str) -> DeviceError {
        DeviceError::UnknownElement(self.name.clone(), element.to_string())
    }
}

fn apply_switches(
    property: &str,
    rule: SwitchRule,
    elements: &mut [SwitchElement],
    updates: &[(String, SwitchState)],
) -> Result<()> {
    for (name, _) in updates {
        if !elements.iter().any(|e| &e.name == name) {
            return Err(DeviceError::UnknownElement(property.to_string(), name.clone()));
        }
    }

    let requested_on: Vec<&str> = updates
        .iter()
        .filter(|(_, s)| *s == SwitchState::On)
        .map(|(n, _)| n.as_str())
        .collect();

    if rule != SwitchRule::NOfMany && requested_on.len() > 1 {
        return Err(DeviceError::InvalidStateTransition(
            property.to_string(),
            format!("{} switches requested on, at most one allowed", requested_on.len()),
        ));
    }

    match (rule, requested_on.first()) {
        (SwitchRule::NOfMany, _) | (_, None) => {
            for (name, state) in updates {
                if let Some(element) = elements.iter_mut().find(|e| &e.name == name) {
                    element.state = *state;
                }
            }
        }
        (_, Some(on)) => {
            for element in elements.iter_mut() {
                element.state = SwitchState::from(element.name == *on);
            }
        }
    }

    if rule == SwitchRule::OneOfMany && !elements.iter().any(|e| e.state == SwitchState::On) {
        return Err(DeviceError::InvalidStateTransition(
            property.to_string(),
            "one switch must remain on".to_string(),
        ));
    }

    Ok(())
}

/// Builder for property vectors
///
/// Validates the model invariants when the vector is built, so every
/// registered vector satisfies them from the start.
#[derive(Debug, Clone)]
pub struct PropertyBuilder {
    device: String,
    name: String,
    label: Option<String>,
    group: String,
    permission: Permission,
    state: PropertyState,
    timeout: f64,
    persist: bool,
    elements: Option<Elements>,
}

impl PropertyBuilder {
    /// Start a vector named `name` on `device`
    pub fn new<D: Into<String>, N: Into<String>>(device: D, name: N) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            label: None,
            group: "Main Control".to_string(),
            permission: Permission::ReadWrite,
            state: PropertyState::Idle,
            timeout: 0.0,
            persist: false,
            elements: None,
        }
    }

    /// Set the display label (defaults to the name)
    pub fn label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the display group
    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = group.into();
        self
    }

    /// Set the permission
    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    /// Set the initial state
    pub fn state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    /// Set the timeout hint in seconds
    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Save the vector with the device configuration
    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Use switch elements
    pub fn switches(mut self, rule: SwitchRule, elements: Vec<SwitchElement>) -> Self {
        self.elements = Some(Elements::Switch { rule, elements });
        self
    }

    /// Use number elements
    pub fn numbers(mut self, elements: Vec<NumberElement>) -> Self {
        self.elements = Some(Elements::Number { elements });
        self
    }

    /// Use text elements
    pub fn texts(mut self, elements: Vec<TextElement>) -> Self {
        self.elements = Some(Elements::Text { elements });
        self
    }

    /// Use light elements; lights are always read-only
    pub fn lights(mut self, elements: Vec<LightElement>) -> Self {
        self.elements = Some(Elements::Light { elements });
        self
    }

    /// Use blob elements
    pub fn blobs(mut self, max_size: Option<usize>, elements: Vec<BlobElement>) -> Self {
        self.elements = Some(Elements::Blob { max_size, elements });
        self
    }

    /// Build and validate the vector
    pub fn build(self) -> Result<Property> {
        let invalid = |reason: String| DeviceError::InvalidDefinition(format!("{}: {}", self.name, reason));

        if self.device.is_empty() || self.name.is_empty() {
            return Err(invalid("device and property names must not be empty".to_string()));
        }
        let elements = self
            .elements
            .clone()
            .ok_or_else(|| invalid("no elements".to_string()))?;

        let names = elements.names();
        if names.is_empty() {
            return Err(invalid("no elements".to_string()));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if name.is_empty() {
                return Err(invalid("empty element name".to_string()));
            }
            if !seen.insert(*name) {
                return Err(invalid(format!("duplicate element {}", name)));
            }
        }

        let mut permission = self.permission;
        match &elements {
            Elements::Switch { rule, elements } => {
                let on = elements.iter().filter(|e| e.state == SwitchState::On).count();
                match rule {
                    SwitchRule::OneOfMany if on != 1 => {
                        return Err(invalid(format!("OneOfMany needs exactly one switch on, found {}", on)));
                    }
                    SwitchRule::AtMostOne if on > 1 => {
                        return Err(invalid(format!("AtMostOne allows one switch on, found {}", on)));
                    }
                    _ => {}
                }
            }
            Elements::Number { elements } => {
                for e in elements {
                    if !(e.min <= e.max) {
                        return Err(invalid(format!("{} has min {} above max {}", e.name, e.min, e.max)));
                    }
                    if !e.accepts(e.value) {
                        return Err(invalid(format!(
                            "{} value {} outside [{}, {}]",
                            e.name, e.value, e.min, e.max
                        )));
                    }
                }
            }
            Elements::Light { .. } => permission = Permission::ReadOnly,
            Elements::Text { .. } | Elements::Blob { .. } => {}
        }

        Ok(Property {
            label: self.label.clone().unwrap_or_else(|| self.name.clone()),
            device: self.device,
            name: self.name,
            group: self.group,
            permission,
            state: self.state,
            timeout: self.timeout,
            elements,
            revision: 0,
            persist: self.persist,
        })
    }
}

/// The properties of one device, in definition order
#[derive(Debug, Clone, Default)]
pub struct Registry {
    properties: Vec<Property>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a property
    ///
    /// Fails with `DuplicateProperty` if the name is taken.
    pub fn insert(&mut self, property: Property) -> Result<()> {
        if self.contains(property.name()) {
            return Err(DeviceError::DuplicateProperty(property.name().to_string()));
        }
        self.properties.push(property);
        Ok(())
    }

    /// Unregister a property
    ///
    /// Fails with `UnknownProperty` if the name is not registered.
    pub fn remove(&mut self, name: &str) -> Result<Property> {
        let index = self
            .properties
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))?;
        Ok(self.properties.remove(index))
    }

    /// Look up a property
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// Look up a property for modification
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name() == name)
    }

    /// Look up a property, failing with `UnknownProperty`
    pub fn require(&self, name: &str) -> Result<&Property> {
        self.get(name)
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))
    }

    /// Look up a property for modification, failing with `UnknownProperty`
    pub fn require_mut(&mut self, name: &str) -> Result<&mut Property> {
        self.get_mut(name)
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))
    }

    /// Whether a property is registered
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered properties in definition order
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    /// Registered names in definition order
    pub fn names(&self) -> Vec<String> {
        self.properties.iter().map(|p| p.name().to_string()).collect()
    }

    /// Number of registered properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
