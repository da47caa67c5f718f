//! Single-query property checks over a status snapshot.

use crate::core::config::EncryptionConfig;
use crate::core::error::StageError;
use crate::core::types::{Outcome, StatusSnapshot};
use crate::gateway::{Command, CommandGateway};
use log::{debug, info};
use mongodb::bson::Bson;

/// Verdict of a property predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyVerdict {
    /// The property holds; the string describes what was observed.
    Holds(String),
    /// The field that should report the property is absent.
    Missing {
        /// Dotted path of the absent field.
        field: String,
    },
    /// The field is present but reports the feature disabled.
    False {
        /// Dotted path of the field.
        field: String,
        /// What the field actually holds.
        value: Bson,
    },
}

/// Result of [`PropertyValidator::check_property`].
#[derive(Debug, Clone)]
pub struct PropertyReport {
    /// Outcome of the check.
    pub outcome: Outcome,
    /// The snapshot the predicate was applied to, when the query succeeded.
    pub snapshot: Option<StatusSnapshot>,
}

/// Issues one status query and evaluates a property on the reply.
pub struct PropertyValidator<'a> {
    gateway: &'a dyn CommandGateway,
}

impl<'a> PropertyValidator<'a> {
    /// Create a validator over `gateway`.
    pub fn new(gateway: &'a dyn CommandGateway) -> Self {
        Self { gateway }
    }

    /// Run `query` exactly once and apply `predicate` to the reply.
    pub fn check_property<P>(&self, query: &Command, predicate: P) -> PropertyReport
    where
        P: Fn(&StatusSnapshot) -> PropertyVerdict,
    {
        debug!("checking property via {}", query);
        let snapshot = match self.gateway.execute(query) {
            Ok(response) => match response.into_status() {
                Some(snapshot) => snapshot,
                None => {
                    return PropertyReport {
                        outcome: Outcome::failure(StageError::UnexpectedReply {
                            command: query.to_string(),
                            detail: "reply carried no status document".to_string(),
                        }),
                        snapshot: None,
                    }
                }
            },
            Err(error) => {
                return PropertyReport {
                    outcome: Outcome::failure(error.into()),
                    snapshot: None,
                }
            }
        };

        let outcome = match predicate(&snapshot) {
            PropertyVerdict::Holds(description) => {
                info!("{}", description);
                Outcome::success(description)
            }
            PropertyVerdict::Missing { field } => {
                Outcome::failure(StageError::PropertyMissing { field })
            }
            PropertyVerdict::False { field, value } => {
                Outcome::failure(StageError::PropertyFalse { field, value })
            }
        };

        PropertyReport {
            outcome,
            snapshot: Some(snapshot),
        }
    }
}

/// Encryption-at-rest predicate over a `serverStatus` snapshot.
///
/// Anything other than a literal `true` in the flag counts as disabled.
pub fn encryption_enabled(
    fields: &EncryptionConfig,
) -> impl Fn(&StatusSnapshot) -> PropertyVerdict + '_ {
    move |snapshot| {
        let field = fields.enabled_path();
        match snapshot.lookup(&field) {
            None => PropertyVerdict::Missing { field },
            Some(Bson::Boolean(true)) => {
                let cipher = snapshot
                    .get_str(&fields.cipher_path())
                    .unwrap_or("unreported")
                    .to_string();
                PropertyVerdict::Holds(format!("encryption at rest active, cipher {}", cipher))
            }
            Some(value) => PropertyVerdict::False {
                field,
                value: value.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayError;
    use crate::gateway::{CommandKind, EncryptionState, MemoryGateway};
    use mongodb::bson::doc;

    fn check(gateway: &MemoryGateway) -> PropertyReport {
        let fields = EncryptionConfig::default();
        PropertyValidator::new(gateway)
            .check_property(&Command::ServerStatus, encryption_enabled(&fields))
    }

    #[test]
    fn test_enabled_reports_cipher() {
        let gateway = MemoryGateway::primary()
            .with_encryption(EncryptionState::Enabled("AES256-GCM".into()));
        let report = check(&gateway);

        assert_eq!(
            report.outcome,
            Outcome::success("encryption at rest active, cipher AES256-GCM")
        );
        assert_eq!(gateway.count(CommandKind::ServerStatus), 1);
    }

    #[test]
    fn test_missing_section_is_distinct_from_false() {
        let absent = MemoryGateway::primary().with_encryption(EncryptionState::Absent);
        let disabled = MemoryGateway::primary().with_encryption(EncryptionState::Disabled);

        assert_eq!(
            check(&absent).outcome.error(),
            Some(&StageError::PropertyMissing {
                field: "encryptionAtRest.encryptionEnabled".to_string()
            })
        );
        assert_eq!(
            check(&disabled).outcome.error(),
            Some(&StageError::PropertyFalse {
                field: "encryptionAtRest.encryptionEnabled".to_string(),
                value: Bson::Boolean(false),
            })
        );
    }

    #[test]
    fn test_non_boolean_flag_counts_as_false() {
        let gateway = MemoryGateway::primary()
            .with_server_status(doc! { "encryptionAtRest": { "encryptionEnabled": "yes" } });
        assert!(matches!(
            check(&gateway).outcome.error(),
            Some(StageError::PropertyFalse { .. })
        ));
    }

    #[test]
    fn test_unreported_cipher() {
        let gateway = MemoryGateway::primary()
            .with_server_status(doc! { "encryptionAtRest": { "encryptionEnabled": true } });
        assert_eq!(
            check(&gateway).outcome.message(),
            "encryption at rest active, cipher unreported"
        );
    }

    #[test]
    fn test_gateway_error_becomes_failure() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(CommandKind::ServerStatus, GatewayError::transport("timed out"));

        let report = check(&gateway);

        assert!(report.snapshot.is_none());
        assert_eq!(report.outcome.error(), Some(&StageError::Transport("timed out".into())));
        assert_eq!(gateway.count(CommandKind::ServerStatus), 1);
    }
}
