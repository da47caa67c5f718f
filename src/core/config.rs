//! Configuration loaded from `tdecheck.toml`.
//!
//! Every section has defaults matching a local single-node deployment, so an
//! empty file (or no file at all) is a valid configuration.

use crate::core::error::{ConfigError, TdeResult};
use crate::core::types::{as_f64, values_equal, Namespace};
use mongodb::bson::{doc, Bson, DateTime, Document};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tdecheck.toml";

/// Complete tdecheck configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How to reach the deployment.
    pub connection: ConnectionConfig,
    /// Replica-set bootstrap and readiness polling.
    pub replica_set: ReplicaSetConfig,
    /// Where encryption at rest is reported in `serverStatus`.
    pub encryption: EncryptionConfig,
    /// The read/write exercise.
    pub exercise: ExerciseConfig,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// MongoDB connection string. `directConnection=true` is required to talk
    /// to a node whose replica set is not initiated yet.
    pub uri: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017/?directConnection=true&serverSelectionTimeoutMS=5000"
                .to_string(),
        }
    }
}

/// Replica-set settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSetConfig {
    /// Replica set name used when initiating.
    pub name: String,
    /// Member host:port pairs used when initiating.
    pub members: Vec<String>,
    /// Initiate the replica set when the node reports it is not initialized.
    pub bootstrap: bool,
    /// Maximum number of status queries while waiting for readiness.
    pub max_attempts: u32,
    /// Delay between status queries in milliseconds.
    pub interval_ms: u64,
    /// Status field holding the member state.
    pub state_field: String,
    /// Member state that counts as ready (1 is PRIMARY).
    pub ready_state: i64,
}

impl Default for ReplicaSetConfig {
    fn default() -> Self {
        Self {
            name: "rs0".to_string(),
            members: vec!["localhost:27017".to_string()],
            bootstrap: true,
            max_attempts: 10,
            interval_ms: 1000,
            state_field: "myState".to_string(),
            ready_state: 1,
        }
    }
}

impl ReplicaSetConfig {
    /// Delay between status queries.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// The `replSetInitiate` configuration document.
    pub fn initiate_document(&self) -> Document {
        let members: Vec<Bson> = self
            .members
            .iter()
            .enumerate()
            .map(|(id, host)| Bson::Document(doc! { "_id": id as i32, "host": host.as_str() }))
            .collect();
        doc! { "_id": self.name.as_str(), "members": members }
    }
}

/// Encryption status field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// `serverStatus` section that reports encryption at rest.
    pub section: String,
    /// Boolean flag inside the section.
    pub enabled_field: String,
    /// Cipher description inside the section.
    pub cipher_field: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            section: "encryptionAtRest".to_string(),
            enabled_field: "encryptionEnabled".to_string(),
            cipher_field: "encryptionCipherMode".to_string(),
        }
    }
}

impl EncryptionConfig {
    /// Dotted path of the enabled flag.
    pub fn enabled_path(&self) -> String {
        format!("{}.{}", self.section, self.enabled_field)
    }

    /// Dotted path of the cipher field.
    pub fn cipher_path(&self) -> String {
        format!("{}.{}", self.section, self.cipher_field)
    }
}

/// How the exercise removes what it wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupMode {
    /// Drop the whole scratch database.
    DropDatabase,
    /// Drop only the scratch collection.
    DropCollection,
    /// Delete the written documents by key.
    DeleteInserted,
}

/// Increment check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementConfig {
    /// Key value of the document to update.
    pub key: toml::Value,
    /// Numeric field to increment.
    pub field: String,
    /// Amount to add.
    pub by: f64,
}

/// Read/write exercise settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExerciseConfig {
    /// Scratch database.
    pub database: String,
    /// Scratch collection.
    pub collection: String,
    /// Field used for point queries when reading back.
    pub key_field: String,
    /// Fields whose values must read back unchanged.
    pub compare_fields: Vec<String>,
    /// Cleanup strategy.
    pub cleanup: CleanupMode,
    /// Numeric field summed by the aggregation check.
    pub sum_field: Option<String>,
    /// Update check.
    pub increment: Option<IncrementConfig>,
    /// Report collection statistics.
    pub stats: bool,
    /// Documents to write. Empty means the built-in sample accounts.
    pub documents: Vec<toml::Table>,
}

impl Default for ExerciseConfig {
    fn default() -> Self {
        Self {
            database: "TDE_TestDB".to_string(),
            collection: "EncryptedCollection".to_string(),
            key_field: "_id".to_string(),
            compare_fields: vec!["name".to_string(), "ssn".to_string(), "balance".to_string()],
            cleanup: CleanupMode::DropDatabase,
            sum_field: Some("balance".to_string()),
            increment: Some(IncrementConfig {
                key: toml::Value::Integer(1),
                field: "balance".to_string(),
                by: 500.0,
            }),
            stats: true,
            documents: Vec::new(),
        }
    }
}

impl ExerciseConfig {
    /// The scratch namespace.
    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.database, &self.collection)
    }

    /// Documents to write, as BSON.
    pub fn bson_documents(&self) -> Result<Vec<Document>, ConfigError> {
        if self.documents.is_empty() {
            return Ok(sample_accounts());
        }
        self.documents
            .iter()
            .enumerate()
            .map(|(index, table)| {
                mongodb::bson::to_document(table)
                    .map_err(|source| ConfigError::Document { index, source })
            })
            .collect()
    }

    /// Key of the increment check, as BSON.
    pub fn increment_key(&self) -> Result<Option<Bson>, ConfigError> {
        match &self.increment {
            Some(increment) => mongodb::bson::to_bson(&increment.key)
                .map(Some)
                .map_err(|source| ConfigError::Document { index: 0, source }),
            None => Ok(None),
        }
    }
}

/// Sample account records written when no documents are configured.
pub fn sample_accounts() -> Vec<Document> {
    vec![
        doc! {
            "_id": 1,
            "name": "John Doe",
            "ssn": "123-45-6789",
            "creditCard": "4532-1234-5678-9012",
            "balance": 10000.5,
        },
        doc! {
            "_id": 2,
            "name": "Jane Smith",
            "ssn": "987-65-4321",
            "creditCard": "5432-9876-5432-1098",
            "balance": 25000.75,
        },
        doc! {
            "_id": 3,
            "name": "Bob Johnson",
            "ssn": "456-78-9123",
            "creditCard": "4111-1111-1111-1111",
            "balance": 5000.0,
        },
    ]
}

/// The single sensitive record used by the `insert` and `read` commands.
///
/// Looked up by `ssn`; `medical_history` carries a visit stamped at creation
/// time, so it is never part of the read-back comparison.
pub fn patient_record() -> Document {
    // 1985-05-20 and 2022-10-15, midnight UTC
    let birth_date = DateTime::from_millis(485_395_200_000);
    let flu_shot = DateTime::from_millis(1_665_792_000_000);
    doc! {
        "patient_name": "John Doe",
        "ssn": "123-456-7890",
        "birth_date": birth_date,
        "medical_history": [
            { "visit_date": DateTime::now(), "reason": "Annual Checkup" },
            { "visit_date": flu_shot, "reason": "Flu Shot" },
        ],
        "notes": "This is a sensitive record and should be encrypted at rest.",
    }
}

/// Key field of [`patient_record`].
pub const PATIENT_KEY_FIELD: &str = "ssn";

/// Fields of [`patient_record`] that must read back unchanged.
pub const PATIENT_COMPARE_FIELDS: [&str; 4] = ["patient_name", "ssn", "birth_date", "notes"];

impl Config {
    /// Load and validate a configuration file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration a command runs with: `explicit` when given, else
    /// `./tdecheck.toml` when it exists, else the defaults.
    pub fn discover(explicit: Option<&Path>) -> TdeResult<Self> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        match explicit {
            Some(path) => Ok(Self::load_from(path)?),
            None if default_file.exists() => Ok(Self::load_from(default_file)?),
            None => Ok(Self::default()),
        }
    }

    /// Write the configuration as pretty TOML.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replica_set.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "replica_set.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.replica_set.bootstrap && self.replica_set.members.is_empty() {
            return Err(ConfigError::Invalid(
                "replica_set.members must list a host when bootstrap is enabled".to_string(),
            ));
        }

        let exercise = &self.exercise;
        if exercise.database.is_empty() || exercise.collection.is_empty() {
            return Err(ConfigError::Invalid(
                "exercise.database and exercise.collection must not be empty".to_string(),
            ));
        }

        let documents = exercise.bson_documents()?;
        for (index, document) in documents.iter().enumerate() {
            if !document.contains_key(&exercise.key_field) {
                return Err(ConfigError::Invalid(format!(
                    "exercise document #{} has no key field '{}'",
                    index, exercise.key_field
                )));
            }
            if let Some(field) = exercise
                .compare_fields
                .iter()
                .find(|field| !document.contains_key(field.as_str()))
            {
                return Err(ConfigError::Invalid(format!(
                    "exercise document #{} has no compare field '{}'",
                    index, field
                )));
            }
        }

        if let Some(key) = exercise.increment_key()? {
            let increment_field =
                exercise.increment.as_ref().map(|i| i.field.as_str()).unwrap_or_default();
            let target = documents.iter().find(|document| {
                document
                    .get(&exercise.key_field)
                    .is_some_and(|value| values_equal(value, &key))
            });
            match target {
                Some(document) if document.get(increment_field).and_then(as_f64).is_some() => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "increment field '{}' is not numeric in document {}",
                        increment_field, key
                    )))
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "increment key {} matches no exercise document",
                        key
                    )))
                }
            }
        }

        Ok(())
    }
}
