//! Read/write exercise against a scratch namespace.
//!
//! The runner clears documents left under its keys by an earlier run, writes
//! a batch of documents, reads every one back by key, runs the configured
//! derived checks and always removes what it wrote.
//! Each step is checked on its own; the first failing step decides the
//! outcome, and cleanup still runs afterwards.

use crate::core::config::{CleanupMode, ExerciseConfig};
use crate::core::error::{ConfigError, StageError, StageResult};
use crate::core::types::{approx_equal, as_f64, values_equal, Namespace, Outcome};
use crate::gateway::{Command, CommandGateway, Payload};
use log::{debug, info, warn};
use mongodb::bson::{doc, Bson, Document};
use serde::Serialize;

/// What to write.
#[derive(Debug, Clone)]
pub struct WriteSpec {
    /// Scratch namespace.
    pub namespace: Namespace,
    /// Documents inserted in one command.
    pub documents: Vec<Document>,
}

/// How to read written documents back.
#[derive(Debug, Clone)]
pub struct ReadSpec {
    /// Field used for point queries.
    pub key_field: String,
    /// Fields that must read back unchanged.
    pub compare_fields: Vec<String>,
}

/// Derived checks run after the read-back.
#[derive(Debug, Clone, PartialEq)]
pub enum ExerciseCheck {
    /// Server-side sum of a numeric field over the written documents.
    Sum {
        /// Field to sum.
        field: String,
    },
    /// `$inc` on one document, then re-read.
    Increment {
        /// Key value of the target document.
        key: Bson,
        /// Numeric field to increment.
        field: String,
        /// Amount added.
        by: f64,
    },
    /// Collection statistics.
    Stats,
}

/// A full exercise.
#[derive(Debug, Clone)]
pub struct ExercisePlan {
    /// Write step.
    pub write: WriteSpec,
    /// Read-back step.
    pub read: ReadSpec,
    /// Derived checks, in order.
    pub checks: Vec<ExerciseCheck>,
    /// Cleanup strategy.
    pub cleanup: CleanupMode,
}

impl ExercisePlan {
    /// Build the plan described by the `[exercise]` configuration section.
    pub fn from_config(config: &ExerciseConfig) -> Result<Self, ConfigError> {
        let mut checks = Vec::new();
        if let Some(field) = &config.sum_field {
            checks.push(ExerciseCheck::Sum { field: field.clone() });
        }
        if let (Some(increment), Some(key)) = (&config.increment, config.increment_key()?) {
            checks.push(ExerciseCheck::Increment {
                key,
                field: increment.field.clone(),
                by: increment.by,
            });
        }
        if config.stats {
            checks.push(ExerciseCheck::Stats);
        }

        Ok(Self {
            write: WriteSpec {
                namespace: config.namespace(),
                documents: config.bson_documents()?,
            },
            read: ReadSpec {
                key_field: config.key_field.clone(),
                compare_fields: config.compare_fields.clone(),
            },
            checks,
            cleanup: config.cleanup,
        })
    }
}

/// One executed step of an exercise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExerciseStep {
    /// Step name (`write`, `read-back`, `sum`, `increment`, `stats`).
    pub name: String,
    /// What the step observed.
    pub outcome: Outcome,
}

/// Result of [`ExerciseRunner::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ExerciseReport {
    /// Overall outcome; the first failing step wins.
    pub outcome: Outcome,
    /// Every step that ran, in order.
    pub steps: Vec<ExerciseStep>,
    /// Non-fatal problems, such as a failed cleanup.
    pub warnings: Vec<String>,
    /// Whether the cleanup command succeeded.
    pub cleanup_ran: bool,
}

/// Identifiers returned by a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    /// Inserted `_id` values, in document order.
    pub ids: Vec<Bson>,
}

/// Runs an [`ExercisePlan`] through a gateway.
pub struct ExerciseRunner<'a> {
    gateway: &'a dyn CommandGateway,
}

impl<'a> ExerciseRunner<'a> {
    /// Create a runner over `gateway`.
    pub fn new(gateway: &'a dyn CommandGateway) -> Self {
        Self { gateway }
    }

    /// Run the whole exercise.
    ///
    /// Documents left behind by an earlier run under the same keys are
    /// removed before the write. Cleanup is issued exactly once, after the
    /// write has been attempted, whatever the other steps returned.
    pub fn run(&self, plan: &ExercisePlan) -> ExerciseReport {
        let namespace = &plan.write.namespace;
        let key_field = &plan.read.key_field;
        let mut steps = Vec::new();
        let mut warnings = Vec::new();

        info!(
            "exercising {} with {} document(s)",
            namespace,
            plan.write.documents.len()
        );
        let stale = document_keys(&plan.write.documents, key_field);
        if !stale.is_empty() {
            match self.clear_keys(namespace, key_field, &stale) {
                Ok(0) => {}
                Ok(removed) => {
                    let message =
                        format!("removed {} stale document(s) from {}", removed, namespace);
                    warn!("{}", message);
                    warnings.push(message);
                }
                Err(error) => {
                    let message =
                        format!("clearing stale documents from {} failed: {}", namespace, error);
                    warn!("{}", message);
                    warnings.push(message);
                }
            }
        }

        let mut written = plan.write.documents.clone();
        let failure = self.run_steps(plan, &mut steps, &mut written).err();

        let keys = document_keys(&written, key_field);
        let cleanup_ran = match self.cleanup(namespace, plan.cleanup, key_field, &keys) {
            Ok(()) => true,
            Err(error) => {
                warn!("cleanup of {} failed: {}", namespace, error);
                warnings.push(format!("cleanup of {} failed: {}", namespace, error));
                false
            }
        };

        let outcome = match failure {
            Some(error) => Outcome::failure(error),
            None => Outcome::success(format!(
                "verified {} document(s) in {} over {} step(s)",
                plan.write.documents.len(),
                namespace,
                steps.len()
            )),
        };

        ExerciseReport {
            outcome,
            steps,
            warnings,
            cleanup_ran,
        }
    }

    /// Run the steps in order. `written` starts as the plan's documents and
    /// gains the generated `_id` of every document that had none.
    fn run_steps(
        &self,
        plan: &ExercisePlan,
        steps: &mut Vec<ExerciseStep>,
        written: &mut [Document],
    ) -> StageResult<()> {
        let namespace = &plan.write.namespace;
        let key_field = &plan.read.key_field;

        let write = self.write(&plan.write).map(|receipt| {
            let message = format!("wrote {} document(s) to {}", receipt.ids.len(), namespace);
            (receipt, message)
        });
        let receipt = record(steps, "write", write)?;

        // Documents without the key field can only be found through their
        // generated identifier.
        if key_field == "_id" {
            for (document, id) in written.iter_mut().zip(&receipt.ids) {
                if !document.contains_key("_id") {
                    document.insert("_id", id.clone());
                }
            }
        }

        let read_back = self
            .read_back(namespace, &plan.read, written)
            .map(|count| ((), format!("read back {} document(s) with matching fields", count)));
        record(steps, "read-back", read_back)?;

        for check in &plan.checks {
            let (name, result) = match check {
                ExerciseCheck::Sum { field } => {
                    ("sum", self.check_sum(namespace, key_field, written, field))
                }
                ExerciseCheck::Increment { key, field, by } => (
                    "increment",
                    self.check_increment(namespace, key_field, written, key, field, *by),
                ),
                ExerciseCheck::Stats => ("stats", self.check_stats(namespace, written.len())),
            };
            record(steps, name, result.map(|message| ((), message)))?;
        }

        Ok(())
    }

    /// Insert every document of `spec` with one command.
    ///
    /// Fails unless the deployment acknowledges the write and returns one
    /// identifier per document.
    pub fn write(&self, spec: &WriteSpec) -> StageResult<WriteReceipt> {
        let command = Command::Insert {
            namespace: spec.namespace.clone(),
            documents: spec.documents.clone(),
        };
        let response = self.gateway.execute(&command)?;
        let ids = response.inserted_ids().map(<[Bson]>::to_vec).unwrap_or_default();

        if !response.acknowledged || ids.len() < spec.documents.len() {
            return Err(StageError::AcknowledgementMissing {
                namespace: spec.namespace.to_string(),
                expected: spec.documents.len(),
                acknowledged: ids.len(),
            });
        }

        debug!("inserted {:?}", ids);
        Ok(WriteReceipt { ids })
    }

    /// Point-query every document in `documents` by key and compare fields.
    ///
    /// Returns the number of documents verified.
    pub fn read_back(
        &self,
        namespace: &Namespace,
        read: &ReadSpec,
        documents: &[Document],
    ) -> StageResult<usize> {
        for (index, written) in documents.iter().enumerate() {
            let key = written.get(&read.key_field).ok_or_else(|| StageError::UnexpectedReply {
                command: format!("read-back on {}", namespace),
                detail: format!("document #{} has no key field '{}'", index, read.key_field),
            })?;
            let filter = doc! { read.key_field.as_str(): key.clone() };
            let found = self.find_one(namespace, filter)?;

            for field in &read.compare_fields {
                let Some(expected) = written.get(field) else {
                    continue;
                };
                let actual = found.get(field);
                if !actual.is_some_and(|actual| values_equal(actual, expected)) {
                    return Err(StageError::ValueMismatch {
                        field: field.clone(),
                        expected: expected.clone(),
                        actual: actual.cloned(),
                    });
                }
            }
            debug!("{} {} read back intact", read.key_field, key);
        }
        Ok(documents.len())
    }

    /// Delete the documents of `namespace` whose `key_field` is one of `keys`.
    ///
    /// Returns the number of documents removed.
    pub fn clear_keys(
        &self,
        namespace: &Namespace,
        key_field: &str,
        keys: &[Bson],
    ) -> StageResult<u64> {
        let command = Command::DeleteMany {
            namespace: namespace.clone(),
            filter: doc! { key_field: { "$in": keys.to_vec() } },
        };
        match self.gateway.execute(&command)?.payload {
            Payload::Deleted { count } => Ok(count),
            _ => Err(StageError::UnexpectedReply {
                command: command.to_string(),
                detail: "reply carried no delete result".to_string(),
            }),
        }
    }

    /// Remove the scratch data with one command.
    pub fn cleanup(
        &self,
        namespace: &Namespace,
        mode: CleanupMode,
        key_field: &str,
        keys: &[Bson],
    ) -> StageResult<()> {
        let command = match mode {
            CleanupMode::DropDatabase => Command::DropDatabase {
                database: namespace.database.clone(),
            },
            CleanupMode::DropCollection => Command::DropCollection {
                namespace: namespace.clone(),
            },
            CleanupMode::DeleteInserted => Command::DeleteMany {
                namespace: namespace.clone(),
                filter: doc! { key_field: { "$in": keys.to_vec() } },
            },
        };
        self.gateway.execute(&command)?;
        info!("cleanup: {}", command);
        Ok(())
    }

    fn find_one(&self, namespace: &Namespace, filter: Document) -> StageResult<Document> {
        let command = Command::FindOne {
            namespace: namespace.clone(),
            filter: filter.clone(),
        };
        match self.gateway.execute(&command)?.into_document() {
            Some(Some(document)) => Ok(document),
            Some(None) => Err(StageError::DocumentNotFound {
                namespace: namespace.to_string(),
                filter,
            }),
            None => Err(StageError::UnexpectedReply {
                command: command.to_string(),
                detail: "reply carried no document result".to_string(),
            }),
        }
    }

    fn check_sum(
        &self,
        namespace: &Namespace,
        key_field: &str,
        documents: &[Document],
        field: &str,
    ) -> StageResult<String> {
        let expected: f64 = documents
            .iter()
            .filter_map(|document| document.get(field).and_then(as_f64))
            .sum();
        let keys = document_keys(documents, key_field);
        let sum = format!("${}", field);
        let command = Command::Aggregate {
            namespace: namespace.clone(),
            pipeline: vec![
                doc! { "$match": { key_field: { "$in": keys } } },
                doc! { "$group": { "_id": Bson::Null, "total": { "$sum": sum } } },
            ],
        };

        let results = self
            .gateway
            .execute(&command)?
            .into_documents()
            .ok_or_else(|| StageError::UnexpectedReply {
                command: command.to_string(),
                detail: "reply carried no result documents".to_string(),
            })?;
        // No matching documents yields no group at all.
        let actual = match results.first() {
            Some(group) => {
                group.get("total").and_then(as_f64).ok_or_else(|| StageError::UnexpectedReply {
                    command: command.to_string(),
                    detail: "group result has no numeric 'total'".to_string(),
                })?
            }
            None => 0.0,
        };

        if !approx_equal(actual, expected) {
            return Err(StageError::ValueMismatch {
                field: format!("sum({})", field),
                expected: Bson::Double(expected),
                actual: Some(Bson::Double(actual)),
            });
        }
        Ok(format!("sum of {} is {}", field, actual))
    }

    fn check_increment(
        &self,
        namespace: &Namespace,
        key_field: &str,
        documents: &mut [Document],
        key: &Bson,
        field: &str,
        by: f64,
    ) -> StageResult<String> {
        let filter = doc! { key_field: key.clone() };
        let target = documents
            .iter_mut()
            .find(|document| document.get(key_field).is_some_and(|value| values_equal(value, key)))
            .ok_or_else(|| StageError::DocumentNotFound {
                namespace: namespace.to_string(),
                filter: filter.clone(),
            })?;
        let before = target.get(field).and_then(as_f64).ok_or_else(|| StageError::ValueMismatch {
            field: field.to_string(),
            expected: Bson::String("a number".to_string()),
            actual: target.get(field).cloned(),
        })?;

        let command = Command::UpdateOne {
            namespace: namespace.clone(),
            filter: filter.clone(),
            update: doc! { "$inc": { field: by } },
        };
        match self.gateway.execute(&command)?.payload {
            Payload::Updated { matched: 0, .. } => {
                return Err(StageError::DocumentNotFound {
                    namespace: namespace.to_string(),
                    filter,
                })
            }
            Payload::Updated { .. } => {}
            _ => {
                return Err(StageError::UnexpectedReply {
                    command: command.to_string(),
                    detail: "reply carried no update result".to_string(),
                })
            }
        }

        let expected = before + by;
        let found = self.find_one(namespace, filter)?;
        let actual = found.get(field).and_then(as_f64);
        if !actual.is_some_and(|actual| approx_equal(actual, expected)) {
            return Err(StageError::ValueMismatch {
                field: field.to_string(),
                expected: Bson::Double(expected),
                actual: found.get(field).cloned(),
            });
        }

        // Later checks see the incremented value.
        target.insert(field, expected);
        Ok(format!("{} of {} incremented by {} to {}", field, key, by, expected))
    }

    fn check_stats(&self, namespace: &Namespace, written: usize) -> StageResult<String> {
        let command = Command::CollectionStats {
            namespace: namespace.clone(),
        };
        let stats = match self.gateway.execute(&command)?.payload {
            Payload::Stats(stats) => stats,
            _ => {
                return Err(StageError::UnexpectedReply {
                    command: command.to_string(),
                    detail: "reply carried no statistics".to_string(),
                })
            }
        };

        if stats.count < written as u64 {
            return Err(StageError::UnexpectedReply {
                command: command.to_string(),
                detail: format!(
                    "count {} is below the {} document(s) written",
                    stats.count, written
                ),
            });
        }
        Ok(format!(
            "{} document(s), storage size {} bytes, average object size {} bytes",
            stats.count, stats.storage_size, stats.avg_obj_size
        ))
    }
}

/// Push a step record and pass the value through.
fn record<T>(
    steps: &mut Vec<ExerciseStep>,
    name: &str,
    result: StageResult<(T, String)>,
) -> StageResult<T> {
    match result {
        Ok((value, message)) => {
            debug!("{}: {}", name, message);
            steps.push(ExerciseStep {
                name: name.to_string(),
                outcome: Outcome::success(message),
            });
            Ok(value)
        }
        Err(error) => {
            steps.push(ExerciseStep {
                name: name.to_string(),
                outcome: Outcome::failure(error.clone()),
            });
            Err(error)
        }
    }
}

fn document_keys(documents: &[Document], key_field: &str) -> Vec<Bson> {
    documents
        .iter()
        .filter_map(|document| document.get(key_field).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::sample_accounts;
    use crate::core::error::{GatewayError, GatewayResult};
    use crate::gateway::{CommandKind, MemoryGateway, Response};

    fn namespace() -> Namespace {
        Namespace::new("testdb", "encrypted_data")
    }

    fn plan(documents: Vec<Document>, checks: Vec<ExerciseCheck>) -> ExercisePlan {
        ExercisePlan {
            write: WriteSpec {
                namespace: namespace(),
                documents,
            },
            read: ReadSpec {
                key_field: "_id".to_string(),
                compare_fields: vec!["name".to_string(), "balance".to_string()],
            },
            checks,
            cleanup: CleanupMode::DropDatabase,
        }
    }

    type Rewrite = Box<dyn Fn(&MemoryGateway, &mut Payload) + Send + Sync>;

    /// Passes every reply of `inner` through `rewrite` before returning it.
    struct Rewriting {
        inner: MemoryGateway,
        rewrite: Rewrite,
    }

    impl Rewriting {
        fn new(rewrite: impl Fn(&MemoryGateway, &mut Payload) + Send + Sync + 'static) -> Self {
            Self {
                inner: MemoryGateway::primary(),
                rewrite: Box::new(rewrite),
            }
        }
    }

    impl CommandGateway for Rewriting {
        fn execute(&self, command: &Command) -> GatewayResult<Response> {
            let mut response = self.inner.execute(command)?;
            (self.rewrite)(&self.inner, &mut response.payload);
            Ok(response)
        }
    }

    fn balance_checks() -> Vec<ExerciseCheck> {
        vec![
            ExerciseCheck::Increment {
                key: Bson::Int32(1),
                field: "balance".to_string(),
                by: 500.0,
            },
            ExerciseCheck::Sum {
                field: "balance".to_string(),
            },
        ]
    }

    #[test]
    fn test_round_trip_reads_back_exact_value() {
        let gateway = MemoryGateway::primary();
        let documents = vec![doc! { "_id": 1, "balance": 10000.5 }];
        let report = ExerciseRunner::new(&gateway).run(&plan(documents, vec![]));

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert_eq!(report.steps.len(), 2);
        assert!(report.cleanup_ran);
        assert_eq!(gateway.count(CommandKind::DropDatabase), 1);
        assert!(gateway.documents(&namespace()).is_empty());
    }

    #[test]
    fn test_sum_of_sample_balances() {
        let gateway = MemoryGateway::primary();
        let report = ExerciseRunner::new(&gateway).run(&plan(
            sample_accounts(),
            vec![ExerciseCheck::Sum {
                field: "balance".to_string(),
            }],
        ));

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert_eq!(report.steps[2].outcome.message(), "sum of balance is 40001.25");
    }

    #[test]
    fn test_increment_then_sum_sees_new_value() {
        let gateway = MemoryGateway::primary();
        let report = ExerciseRunner::new(&gateway).run(&plan(
            sample_accounts(),
            vec![
                ExerciseCheck::Increment {
                    key: Bson::Int32(1),
                    field: "balance".to_string(),
                    by: 500.0,
                },
                ExerciseCheck::Sum {
                    field: "balance".to_string(),
                },
            ],
        ));

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert_eq!(report.steps[2].outcome.message(), "balance of 1 incremented by 500 to 10500.5");
        assert_eq!(report.steps[3].outcome.message(), "sum of balance is 40501.25");
    }

    #[test]
    fn test_stats_counts_written_documents() {
        let gateway = MemoryGateway::primary();
        let plan = plan(sample_accounts(), vec![ExerciseCheck::Stats]);
        let report = ExerciseRunner::new(&gateway).run(&plan);

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert!(report.steps[2].outcome.message().starts_with("3 document(s)"));
    }

    #[test]
    fn test_unacknowledged_write_fails_and_still_cleans_up() {
        let gateway = MemoryGateway::primary().with_unacknowledged_writes();
        let report = ExerciseRunner::new(&gateway).run(&plan(sample_accounts(), vec![]));

        assert_eq!(
            report.outcome.error(),
            Some(&StageError::AcknowledgementMissing {
                namespace: "testdb.encrypted_data".to_string(),
                expected: 3,
                acknowledged: 0,
            })
        );
        assert_eq!(gateway.count(CommandKind::FindOne), 0);
        assert_eq!(gateway.count(CommandKind::DropDatabase), 1);
    }

    #[test]
    fn test_rejected_write_still_cleans_up() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(
            CommandKind::Insert,
            GatewayError::rejected(11000, "DuplicateKey", "dup key"),
        );

        let report = ExerciseRunner::new(&gateway).run(&plan(sample_accounts(), vec![]));

        assert!(matches!(report.outcome.error(), Some(StageError::Rejected { code: 11000, .. })));
        assert_eq!(report.steps.len(), 1);
        assert_eq!(gateway.count(CommandKind::DropDatabase), 1);
    }

    #[test]
    fn test_value_mismatch_is_reported() {
        let gateway = Rewriting::new(|_, payload| {
            if let Payload::Document(Some(document)) = payload {
                document.insert("balance", 10000.25);
            }
        });
        let documents = vec![doc! { "_id": 1, "balance": 10000.5 }];

        let report = ExerciseRunner::new(&gateway).run(&plan(documents, vec![]));

        assert_eq!(
            report.outcome.error(),
            Some(&StageError::ValueMismatch {
                field: "balance".to_string(),
                expected: Bson::Double(10000.5),
                actual: Some(Bson::Double(10000.25)),
            })
        );
        assert_eq!(gateway.inner.count(CommandKind::DropDatabase), 1);
    }

    #[test]
    fn test_wrong_sum_fails_and_cleans_up_once() {
        let gateway = Rewriting::new(|_, payload| {
            if let Payload::Documents(groups) = payload {
                for group in groups {
                    group.insert("total", 1.0);
                }
            }
        });

        let report = ExerciseRunner::new(&gateway).run(&plan(
            sample_accounts(),
            vec![ExerciseCheck::Sum {
                field: "balance".to_string(),
            }],
        ));

        assert_eq!(
            report.outcome.error(),
            Some(&StageError::ValueMismatch {
                field: "sum(balance)".to_string(),
                expected: Bson::Double(40001.25),
                actual: Some(Bson::Double(1.0)),
            })
        );
        assert_eq!(report.steps.len(), 3);
        assert!(report.cleanup_ran);
        assert_eq!(gateway.inner.count(CommandKind::DropDatabase), 1);
    }

    #[test]
    fn test_lost_increment_fails_and_cleans_up_once() {
        // Point queries after the update still see the old balance.
        let gateway = Rewriting::new(|inner, payload| {
            if let Payload::Document(Some(document)) = payload {
                if inner.count(CommandKind::UpdateOne) > 0 {
                    document.insert("balance", 10000.5);
                }
            }
        });

        let report = ExerciseRunner::new(&gateway).run(&plan(sample_accounts(), balance_checks()));

        assert_eq!(
            report.outcome.error(),
            Some(&StageError::ValueMismatch {
                field: "balance".to_string(),
                expected: Bson::Double(10500.5),
                actual: Some(Bson::Double(10000.5)),
            })
        );
        assert_eq!(report.steps.last().map(|step| step.name.as_str()), Some("increment"));
        assert_eq!(gateway.inner.count(CommandKind::Aggregate), 0);
        assert_eq!(gateway.inner.count(CommandKind::DropDatabase), 1);
    }

    #[test]
    fn test_cleanup_failure_is_only_a_warning() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(CommandKind::DropDatabase, GatewayError::transport("connection reset"));

        let report = ExerciseRunner::new(&gateway).run(&plan(sample_accounts(), vec![]));

        assert!(report.outcome.is_success());
        assert!(!report.cleanup_ran);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("connection reset"));
        assert_eq!(gateway.count(CommandKind::DropDatabase), 1);
    }

    #[test]
    fn test_rerun_after_failed_cleanup_clears_stale_documents() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(CommandKind::DropDatabase, GatewayError::transport("connection reset"));
        let plan = plan(sample_accounts(), balance_checks());

        let first = ExerciseRunner::new(&gateway).run(&plan);
        assert!(first.outcome.is_success(), "{}", first.outcome);
        assert!(!first.cleanup_ran);
        assert_eq!(gateway.documents(&namespace()).len(), 3);

        let second = ExerciseRunner::new(&gateway).run(&plan);

        assert!(second.outcome.is_success(), "{}", second.outcome);
        assert!(second.cleanup_ran);
        assert_eq!(second.warnings, vec!["removed 3 stale document(s) from testdb.encrypted_data"]);
        assert_eq!(second.steps[3].outcome.message(), "sum of balance is 40501.25");
        assert!(gateway.documents(&namespace()).is_empty());
    }

    #[test]
    fn test_failed_stale_clear_is_only_a_warning() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(CommandKind::DeleteMany, GatewayError::transport("connection reset"));

        let report = ExerciseRunner::new(&gateway).run(&plan(sample_accounts(), vec![]));

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("clearing stale documents from testdb"));
        assert_eq!(gateway.count(CommandKind::Insert), 1);
    }

    #[test]
    fn test_delete_inserted_leaves_other_documents() {
        let gateway = MemoryGateway::primary();
        gateway.seed(&namespace(), vec![doc! { "_id": 99, "name": "keep" }]);
        let mut plan = plan(sample_accounts(), vec![]);
        plan.cleanup = CleanupMode::DeleteInserted;

        let report = ExerciseRunner::new(&gateway).run(&plan);

        assert!(report.outcome.is_success(), "{}", report.outcome);
        let left = gateway.documents(&namespace());
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].get_i32("_id").unwrap(), 99);
        // One clear of stale keys before the write, one cleanup after.
        assert_eq!(gateway.count(CommandKind::DeleteMany), 2);
    }

    #[test]
    fn test_delete_inserted_removes_generated_ids() {
        let gateway = MemoryGateway::primary();
        let mut plan = plan(vec![doc! { "name": "anonymous", "balance": 1.5 }], vec![]);
        plan.cleanup = CleanupMode::DeleteInserted;

        let report = ExerciseRunner::new(&gateway).run(&plan);

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert!(report.cleanup_ran);
        assert!(report.warnings.is_empty());
        assert!(gateway.documents(&namespace()).is_empty());
        // Nothing to clear beforehand: the document has no key yet.
        assert_eq!(gateway.count(CommandKind::DeleteMany), 1);
    }

    #[test]
    fn test_documents_without_id_use_generated_ids() {
        let gateway = MemoryGateway::primary();
        let report = ExerciseRunner::new(&gateway).run(&plan(
            vec![doc! { "name": "anonymous", "balance": 1.5 }],
            vec![],
        ));
        assert!(report.outcome.is_success(), "{}", report.outcome);
    }

    #[test]
    fn test_plan_from_default_config() {
        let plan = ExercisePlan::from_config(&ExerciseConfig::default()).unwrap();
        assert_eq!(plan.write.documents.len(), 3);
        assert_eq!(plan.checks.len(), 3);
        assert!(matches!(plan.checks[1], ExerciseCheck::Increment { by, .. } if by == 500.0));
    }
}
