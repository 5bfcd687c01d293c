use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EcsError, Result};

/// Identity descriptor of a context: a display name plus one name per
/// component index. Used in diagnostics and matcher rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub name: String,
    pub component_names: Vec<String>,
    /// Optional Rust type names, parallel to `component_names`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_types: Vec<String>,
}

impl ContextInfo {
    pub const UNNAMED: &'static str = "Unnamed Context";

    pub fn new(name: impl Into<String>, component_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            component_names,
            component_types: Vec::new(),
        }
    }

    /// Default descriptor: `Unnamed Context` with `Index 0..n-1` names.
    pub fn unnamed(total_components: usize) -> Self {
        Self::new(
            Self::UNNAMED,
            (0..total_components).map(|i| format!("Index {i}")).collect(),
        )
    }

    /// Fails with [`EcsError::ComponentNameCountMismatch`] unless the name
    /// table covers exactly `total_components` indices.
    pub fn validate(&self, total_components: usize) -> Result<()> {
        if self.component_names.len() != total_components {
            return Err(EcsError::ComponentNameCountMismatch {
                context: self.name.clone(),
                expected: total_components,
                actual: self.component_names.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn shared_names(&self) -> Arc<[String]> {
        self.component_names.iter().cloned().collect()
    }

    /// Parses a descriptor from RON text.
    ///
    /// ```
    /// # #[cfg(feature = "serialize-ron")] {
    /// use entitas_ecs::ContextInfo;
    ///
    /// let info = ContextInfo::from_ron_str(
    ///     r#"(name: "Game", component_names: ["Position", "Velocity"])"#,
    /// ).unwrap();
    /// assert_eq!(info.component_names.len(), 2);
    /// # }
    /// ```
    #[cfg(feature = "serialize-ron")]
    pub fn from_ron_str(source: &str) -> std::result::Result<Self, ron::error::SpannedError> {
        ron::from_str(source)
    }

    #[cfg(feature = "serialize-ron")]
    pub fn to_ron_string(&self) -> std::result::Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}

impl fmt::Display for ContextInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
