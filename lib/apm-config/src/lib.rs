//! Configuration loading for the APM agent core.
//!
//! Sources are layered with `figment`: each source added later overrides the keys it defines in the sources added
//! before it. The merged result is either deserialized wholesale or queried key by key through
//! [`GenericConfiguration`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider as _,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;

use self::provider::FileProvider;

/// A generic error.
pub type GenericError = anyhow::Error;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Text describing the keys that would satisfy the lookup.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field held a value of a different type than expected.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other failure while reading or extracting configuration.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&HashSet::new(), e)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct EnvironmentPrefix(String);

impl EnvironmentPrefix {
    fn variable_for(&self, key: &str) -> String {
        format!("{}{}", self.0, key.replace('.', "_").to_uppercase())
    }
}

/// Builds a layered configuration from files, environment variables and in-memory values.
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: HashSet<EnvironmentPrefix>,
    figment: Figment,
}

impl ConfigurationLoader {
    /// Layers the given YAML file on top of the sources added so far.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid YAML, an error is returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.figment = self.figment.admerge(provider);
        Ok(self)
    }

    /// Layers the given YAML file on top of the sources added so far, skipping it if it cannot be loaded.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => self.figment = self.figment.admerge(provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Skipping unreadable YAML configuration file.")
            }
        }
        self
    }

    /// Layers the given JSON file on top of the sources added so far.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid JSON, an error is returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        self.figment = self.figment.admerge(provider);
        Ok(self)
    }

    /// Layers environment variables starting with `prefix` on top of the sources added so far.
    ///
    /// An underscore is appended to the prefix when missing, so `apm` matches `APM_SAMPLING_TARGET`. Matching is
    /// case-insensitive. A double underscore descends into a nested map, so `APM_SYNTHETICS__ENABLED` sets
    /// `synthetics.enabled`. Single underscores are kept, leaving flat keys such as `distributed_tracing_enabled`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // Snapshot the variables now so the merged figment only holds plain values.
        let values = Env::prefixed(&prefix).split("__").data()?;
        if let Some(dict) = values.get(&figment::Profile::Default) {
            self.figment = self.figment.admerge(Serialized::defaults(dict.clone()));
            self.env_prefixes.insert(EnvironmentPrefix(prefix));
        }
        Ok(self)
    }

    /// Layers an in-memory value on top of the sources added so far.
    ///
    /// The value must serialize to a map. This is mostly useful for defaults computed at runtime and for tests.
    pub fn from_values<T>(mut self, values: T) -> Self
    where
        T: Serialize,
    {
        self.figment = self.figment.admerge(Serialized::defaults(values));
        self
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.figment
            .extract()
            .map_err(|e| from_figment_error(&self.env_prefixes, e))
    }

    /// Consumes the loader and wraps the merged configuration for key-based queries.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                env_prefixes: self.env_prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: HashSet<EnvironmentPrefix>,
}

/// A merged, read-only configuration.
///
/// Keys take the form `a.b.c`, where each period descends into a nested map. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Creates an empty configuration, where every lookup misses.
    pub fn empty() -> Self {
        ConfigurationLoader::default().into_generic()
    }

    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = &self.inner.figment;
        match figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => {
                // Environment variables are flat, so `a.b` may only exist as `a_b`.
                figment
                    .extract_inner(&key.replace('.', "_"))
                    .map_err(|fallback_e| from_figment_error(&self.inner.env_prefixes, fallback_e))
            }
            Err(e) => Err(from_figment_error(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error is returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, falling back to `T::default()` on any error.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but its value could not be deserialized into `T`, an error is returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.env_prefixes, e))
    }
}

fn from_figment_error(env_prefixes: &HashSet<EnvironmentPrefix>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut candidates = vec![field.to_string()];
            candidates.extend(env_prefixes.iter().map(|prefix| prefix.variable_for(&field)));
            let help_text = format!("Try setting `{}`.", candidates.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
