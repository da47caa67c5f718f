//! In-process simulated deployment.
//!
//! `MemoryGateway` models just enough of a single-node replica set to drive
//! the whole pipeline without a server: replica-set phase transitions, a
//! `serverStatus` document, collections with equality/`$in` filters, the
//! `$match`/`$group` aggregation subset used by the exercise, `$inc`/`$set`
//! updates, one-shot fault injection and a log of every command received.

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{as_f64, values_equal, Namespace, StatusSnapshot};
use crate::gateway::{CollectionStats, Command, CommandGateway, CommandKind, Payload, Response};
use log::debug;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

const PRIMARY: i32 = 1;
const STARTUP2: i32 = 5;

/// What the simulated `serverStatus` reports about encryption at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionState {
    /// Encryption enabled with the given cipher.
    Enabled(String),
    /// The section is present but the flag is false.
    Disabled,
    /// No encryption section at all.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaPhase {
    Uninitialized,
    /// Initiated; this many more status queries report STARTUP2.
    Electing { remaining: u32 },
    Primary,
}

#[derive(Debug)]
struct Fault {
    kind: CommandKind,
    /// Matching commands that still pass before this fault fires.
    skip: u32,
    error: GatewayError,
}

#[derive(Debug)]
struct MemoryState {
    phase: ReplicaPhase,
    elect_after: u32,
    server_status: Document,
    collections: BTreeMap<Namespace, Vec<Document>>,
    faults: VecDeque<Fault>,
    acknowledge_writes: bool,
    log: Vec<CommandKind>,
}

/// Simulated deployment implementing [`CommandGateway`].
#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    /// A node that is already primary with encryption enabled.
    pub fn primary() -> Self {
        Self::with_phase(ReplicaPhase::Primary, 0)
    }

    /// A node that reports STARTUP2 for `not_ready` status queries and then
    /// becomes primary.
    pub fn electing(not_ready: u32) -> Self {
        let phase = if not_ready == 0 {
            ReplicaPhase::Primary
        } else {
            ReplicaPhase::Electing { remaining: not_ready }
        };
        Self::with_phase(phase, not_ready)
    }

    /// A node whose replica set has not been initiated. After initiation it
    /// reports STARTUP2 for `elect_after` status queries, then primary.
    pub fn uninitialized(elect_after: u32) -> Self {
        Self::with_phase(ReplicaPhase::Uninitialized, elect_after)
    }

    fn with_phase(phase: ReplicaPhase, elect_after: u32) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                phase,
                elect_after,
                server_status: server_status(&EncryptionState::Enabled("AES256-CBC".to_string())),
                collections: BTreeMap::new(),
                faults: VecDeque::new(),
                acknowledge_writes: true,
                log: Vec::new(),
            }),
        }
    }

    /// Set what `serverStatus` reports about encryption.
    pub fn with_encryption(self, encryption: EncryptionState) -> Self {
        self.state.lock().server_status = server_status(&encryption);
        self
    }

    /// Replace the whole `serverStatus` reply.
    pub fn with_server_status(self, status: Document) -> Self {
        self.state.lock().server_status = status;
        self
    }

    /// Report inserts as unacknowledged.
    pub fn with_unacknowledged_writes(self) -> Self {
        self.state.lock().acknowledge_writes = false;
        self
    }

    /// Fail the next command of `kind` with `error`. Faults queue up in order.
    pub fn fail_next(&self, kind: CommandKind, error: GatewayError) {
        self.fail_after(kind, 0, error);
    }

    /// Let `skip` commands of `kind` through, then fail the next one.
    pub fn fail_after(&self, kind: CommandKind, skip: u32, error: GatewayError) {
        self.state.lock().faults.push_back(Fault { kind, skip, error });
    }

    /// Every command received so far, in order.
    pub fn calls(&self) -> Vec<CommandKind> {
        self.state.lock().log.clone()
    }

    /// Number of commands of `kind` received so far.
    pub fn count(&self, kind: CommandKind) -> usize {
        self.state.lock().log.iter().filter(|k| **k == kind).count()
    }

    /// Documents currently stored in `namespace`.
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Store documents directly, bypassing the command log.
    pub fn seed(&self, namespace: &Namespace, documents: Vec<Document>) {
        self.state
            .lock()
            .collections
            .entry(namespace.clone())
            .or_default()
            .extend(documents);
    }
}

impl CommandGateway for MemoryGateway {
    fn execute(&self, command: &Command) -> GatewayResult<Response> {
        let mut state = self.state.lock();
        let kind = command.kind();
        state.log.push(kind);
        debug!("simulating {}", command);

        if let Some(position) = state.faults.iter().position(|fault| fault.kind == kind) {
            if state.faults[position].skip > 0 {
                state.faults[position].skip -= 1;
            } else if let Some(fault) = state.faults.remove(position) {
                return Err(fault.error);
            }
        }

        state.apply(command)
    }
}

impl MemoryState {
    fn apply(&mut self, command: &Command) -> GatewayResult<Response> {
        match command {
            Command::ReplicaSetStatus => self.replica_set_status(),
            Command::ReplicaSetInitiate { config } => self.initiate(config),
            Command::ServerStatus => Ok(Response::ack(Payload::Status(StatusSnapshot::new(
                self.server_status.clone(),
            )))),
            Command::Insert { namespace, documents } => self.insert(namespace, documents),
            Command::FindOne { namespace, filter } => {
                let found = self
                    .collection(namespace)
                    .iter()
                    .find(|document| matches_filter(document, filter))
                    .cloned();
                Ok(Response::ack(Payload::Document(found)))
            }
            Command::Aggregate { namespace, pipeline } => {
                let documents = aggregate(self.collection(namespace), pipeline)?;
                Ok(Response::ack(Payload::Documents(documents)))
            }
            Command::UpdateOne {
                namespace,
                filter,
                update,
            } => self.update_one(namespace, filter, update),
            Command::CollectionStats { namespace } => {
                let documents = self.collection(namespace);
                let storage_size: u64 = documents
                    .iter()
                    .map(|document| {
                        mongodb::bson::to_vec(document).map(|bytes| bytes.len() as u64).unwrap_or(0)
                    })
                    .sum();
                let count = documents.len() as u64;
                let avg_obj_size = if count == 0 { 0 } else { storage_size / count };
                Ok(Response::ack(Payload::Stats(CollectionStats {
                    count,
                    storage_size,
                    avg_obj_size,
                })))
            }
            Command::DeleteMany { namespace, filter } => {
                let mut count = 0;
                if let Some(documents) = self.collections.get_mut(namespace) {
                    let before = documents.len();
                    documents.retain(|document| !matches_filter(document, filter));
                    count = (before - documents.len()) as u64;
                }
                Ok(Response::ack(Payload::Deleted { count }))
            }
            Command::DropCollection { namespace } => {
                self.collections.remove(namespace);
                Ok(Response::ack(Payload::None))
            }
            Command::DropDatabase { database } => {
                self.collections.retain(|namespace, _| &namespace.database != database);
                Ok(Response::ack(Payload::None))
            }
        }
    }

    fn collection(&self, namespace: &Namespace) -> &[Document] {
        self.collections
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn replica_set_status(&mut self) -> GatewayResult<Response> {
        let state = match self.phase {
            ReplicaPhase::Uninitialized => {
                return Err(GatewayError::not_yet_initialized(
                    "no replset config has been received",
                ))
            }
            ReplicaPhase::Electing { remaining } => {
                self.phase = if remaining <= 1 {
                    ReplicaPhase::Primary
                } else {
                    ReplicaPhase::Electing {
                        remaining: remaining - 1,
                    }
                };
                STARTUP2
            }
            ReplicaPhase::Primary => PRIMARY,
        };
        let state_str = if state == PRIMARY { "PRIMARY" } else { "STARTUP2" };
        Ok(Response::ack(Payload::Status(StatusSnapshot::new(doc! {
            "set": "rs0",
            "myState": state,
            "myStateStr": state_str,
            "ok": 1.0,
        }))))
    }

    fn initiate(&mut self, config: &Document) -> GatewayResult<Response> {
        if self.phase != ReplicaPhase::Uninitialized {
            return Err(GatewayError::rejected(23, "AlreadyInitialized", "already initialized"));
        }
        if config.get_array("members").map(Vec::is_empty).unwrap_or(true) {
            return Err(GatewayError::rejected(
                93,
                "InvalidReplicaSetConfig",
                "replica set configuration must contain at least one member",
            ));
        }
        self.phase = if self.elect_after == 0 {
            ReplicaPhase::Primary
        } else {
            ReplicaPhase::Electing {
                remaining: self.elect_after,
            }
        };
        Ok(Response::ack(Payload::Status(StatusSnapshot::new(doc! { "ok": 1.0 }))))
    }

    fn insert(&mut self, namespace: &Namespace, documents: &[Document]) -> GatewayResult<Response> {
        let acknowledged = self.acknowledge_writes;
        let collection = self.collections.entry(namespace.clone()).or_default();
        let mut ids = Vec::with_capacity(documents.len());

        for document in documents {
            let mut document = document.clone();
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            if collection
                .iter()
                .any(|existing| existing.get("_id").is_some_and(|other| values_equal(other, &id)))
            {
                return Err(GatewayError::rejected(
                    11000,
                    "DuplicateKey",
                    format!("E11000 duplicate key error collection: {} dup key: {}", namespace, id),
                ));
            }
            collection.push(document);
            ids.push(id);
        }

        if acknowledged {
            Ok(Response::ack(Payload::Inserted { ids }))
        } else {
            Ok(Response::unacknowledged(Payload::Inserted { ids: Vec::new() }))
        }
    }

    fn update_one(
        &mut self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> GatewayResult<Response> {
        let Some(document) = self.collections.get_mut(namespace).and_then(|documents| {
            documents.iter_mut().find(|document| matches_filter(document, filter))
        }) else {
            return Ok(Response::ack(Payload::Updated { matched: 0, modified: 0 }));
        };

        let before = document.clone();
        for (operator, fields) in update {
            let fields = fields.as_document().ok_or_else(|| {
                let message = format!("{} expects a document", operator);
                GatewayError::rejected(9, "FailedToParse", message)
            })?;
            match operator.as_str() {
                "$inc" => {
                    for (field, amount) in fields {
                        let current = document.get(field).cloned().unwrap_or(Bson::Int32(0));
                        let sum = add_numbers(&current, amount).ok_or_else(|| {
                            GatewayError::rejected(
                                14,
                                "TypeMismatch",
                                format!("cannot apply $inc to non-numeric field '{}'", field),
                            )
                        })?;
                        document.insert(field.clone(), sum);
                    }
                }
                "$set" => {
                    for (field, value) in fields {
                        document.insert(field.clone(), value.clone());
                    }
                }
                other => {
                    return Err(GatewayError::rejected(
                        9,
                        "FailedToParse",
                        format!("unknown update operator: {}", other),
                    ))
                }
            }
        }

        let modified = u64::from(*document != before);
        Ok(Response::ack(Payload::Updated { matched: 1, modified }))
    }
}

fn server_status(encryption: &EncryptionState) -> Document {
    let mut status = doc! {
        "host": "localhost:27017",
        "version": "7.0.0",
        "process": "mongod",
        "ok": 1.0,
    };
    match encryption {
        EncryptionState::Enabled(cipher) => {
            status.insert(
                "encryptionAtRest",
                doc! { "encryptionEnabled": true, "encryptionCipherMode": cipher.as_str() },
            );
        }
        EncryptionState::Disabled => {
            status.insert("encryptionAtRest", doc! { "encryptionEnabled": false });
        }
        EncryptionState::Absent => {}
    }
    status
}

/// Top-level equality and `$in` matching; an empty filter matches everything.
fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, condition)| {
        let value = document.get(field);
        match condition {
            Bson::Document(operators) if operators.keys().all(|key| key.starts_with('$')) => {
                operators.iter().all(|(operator, argument)| match (operator.as_str(), argument) {
                    ("$in", Bson::Array(candidates)) => value.is_some_and(|value| {
                        candidates.iter().any(|candidate| values_equal(value, candidate))
                    }),
                    _ => false,
                })
            }
            expected => value.is_some_and(|value| values_equal(value, expected)),
        }
    })
}

fn add_numbers(left: &Bson, right: &Bson) -> Option<Bson> {
    match (left, right) {
        (Bson::Int32(l), Bson::Int32(r)) => Some(Bson::Int64(i64::from(*l) + i64::from(*r))),
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let l = crate::core::types::as_i64(left)?;
            let r = crate::core::types::as_i64(right)?;
            Some(Bson::Int64(l + r))
        }
        _ => Some(Bson::Double(as_f64(left)? + as_f64(right)?)),
    }
}

fn aggregate(documents: &[Document], pipeline: &[Document]) -> GatewayResult<Vec<Document>> {
    let mut current: Vec<Document> = documents.to_vec();

    for stage in pipeline {
        let Some((name, spec)) = stage.iter().next() else {
            return Err(GatewayError::rejected(40323, "Location40323", "empty pipeline stage"));
        };
        match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                current.retain(|document| matches_filter(document, filter));
            }
            ("$group", Bson::Document(group)) => {
                current = group_all(&current, group)?;
            }
            _ => {
                return Err(GatewayError::rejected(
                    40324,
                    "Location40324",
                    format!("Unrecognized pipeline stage name: '{}'", name),
                ))
            }
        }
    }

    Ok(current)
}

/// `$group` with `_id: null` and `$sum` accumulators.
fn group_all(documents: &[Document], group: &Document) -> GatewayResult<Vec<Document>> {
    if documents.is_empty() {
        return Ok(Vec::new());
    }
    if !matches!(group.get("_id"), Some(Bson::Null)) {
        return Err(GatewayError::rejected(
            15952,
            "Location15952",
            "only _id: null grouping is simulated",
        ));
    }

    let mut result = doc! { "_id": Bson::Null };
    for (name, accumulator) in group.iter().filter(|(name, _)| name.as_str() != "_id") {
        let operand = accumulator
            .as_document()
            .and_then(|accumulator| accumulator.get("$sum"))
            .ok_or_else(|| {
                GatewayError::rejected(15952, "Location15952", "only $sum is simulated")
            })?;

        let mut total = Bson::Int32(0);
        for document in documents {
            let value = match operand {
                Bson::String(path) if path.starts_with('$') => document.get(&path[1..]).cloned(),
                literal => Some(literal.clone()),
            };
            // $sum ignores non-numeric values.
            if let Some(value) = value.filter(|value| as_f64(value).is_some()) {
                total = add_numbers(&total, &value).unwrap_or(total);
            }
        }
        result.insert(name.clone(), total);
    }

    Ok(vec![result])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts() -> Namespace {
        Namespace::new("testdb", "encrypted_data")
    }

    #[test]
    fn test_uninitialized_then_initiate() {
        let gateway = MemoryGateway::uninitialized(1);

        let first = gateway.execute(&Command::ReplicaSetStatus);
        assert!(matches!(first, Err(GatewayError::NotYetInitialized { .. })));

        let config = doc! { "_id": "rs0", "members": [{ "_id": 0, "host": "localhost:27017" }] };
        let initiated = gateway
            .execute(&Command::ReplicaSetInitiate { config: config.clone() })
            .unwrap();
        assert!(initiated.acknowledged);

        let electing = gateway.execute(&Command::ReplicaSetStatus).unwrap().into_status().unwrap();
        assert_eq!(electing.get_i64("myState"), Some(5));
        let primary = gateway.execute(&Command::ReplicaSetStatus).unwrap().into_status().unwrap();
        assert_eq!(primary.get_str("myStateStr"), Some("PRIMARY"));

        let again = gateway.execute(&Command::ReplicaSetInitiate { config });
        assert!(matches!(again, Err(GatewayError::Rejected { code: 23, .. })));
    }

    #[test]
    fn test_insert_find_and_duplicate_key() {
        let gateway = MemoryGateway::primary();
        let insert = Command::Insert {
            namespace: accounts(),
            documents: vec![doc! { "_id": 1, "balance": 10000.5 }],
        };
        let response = gateway.execute(&insert).unwrap();
        assert_eq!(response.inserted_ids(), Some(&[Bson::Int32(1)][..]));

        let found = gateway
            .execute(&Command::FindOne {
                namespace: accounts(),
                filter: doc! { "_id": 1_i64 },
            })
            .unwrap()
            .into_document()
            .unwrap()
            .unwrap();
        assert_eq!(found.get_f64("balance").unwrap(), 10000.5);

        let duplicate = gateway.execute(&insert);
        assert!(matches!(duplicate, Err(GatewayError::Rejected { code: 11000, .. })));
    }

    #[test]
    fn test_sum_and_increment() {
        let gateway = MemoryGateway::primary();
        gateway.seed(
            &accounts(),
            vec![
                doc! { "_id": 1, "balance": 10000.5 },
                doc! { "_id": 2, "balance": 25000.75 },
                doc! { "_id": 3, "balance": 5000.0 },
            ],
        );

        let totals = gateway
            .execute(&Command::Aggregate {
                namespace: accounts(),
                pipeline: vec![
                    doc! { "$match": { "_id": { "$in": [1, 2, 3] } } },
                    doc! { "$group": { "_id": null, "total": { "$sum": "$balance" } } },
                ],
            })
            .unwrap()
            .into_documents()
            .unwrap();
        assert_eq!(totals[0].get_f64("total").unwrap(), 40001.25);

        gateway
            .execute(&Command::UpdateOne {
                namespace: accounts(),
                filter: doc! { "_id": 1 },
                update: doc! { "$inc": { "balance": 500.0 } },
            })
            .unwrap();
        let documents = gateway.documents(&accounts());
        assert_eq!(documents[0].get_f64("balance").unwrap(), 10500.5);
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let gateway = MemoryGateway::primary();
        let result = gateway.execute(&Command::Aggregate {
            namespace: accounts(),
            pipeline: vec![doc! { "$lookup": {} }],
        });
        assert!(matches!(result, Err(GatewayError::Rejected { code: 40324, .. })));
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(CommandKind::ServerStatus, GatewayError::transport("connection reset"));

        assert!(gateway.execute(&Command::ServerStatus).is_err());
        assert!(gateway.execute(&Command::ServerStatus).is_ok());
        assert_eq!(gateway.count(CommandKind::ServerStatus), 2);
    }

    #[test]
    fn test_drop_database_removes_all_collections() {
        let gateway = MemoryGateway::primary();
        gateway.seed(&accounts(), vec![doc! { "_id": 1 }]);
        gateway.seed(&Namespace::new("testdb", "other"), vec![doc! { "_id": 1 }]);
        gateway.seed(&Namespace::new("keep", "other"), vec![doc! { "_id": 1 }]);

        gateway
            .execute(&Command::DropDatabase { database: "testdb".into() })
            .unwrap();

        assert!(gateway.documents(&accounts()).is_empty());
        assert_eq!(gateway.documents(&Namespace::new("keep", "other")).len(), 1);
    }

    #[test]
    fn test_encryption_states() {
        let disabled = MemoryGateway::primary().with_encryption(EncryptionState::Disabled);
        let status = disabled.execute(&Command::ServerStatus).unwrap().into_status().unwrap();
        assert_eq!(status.get_bool("encryptionAtRest.encryptionEnabled"), Some(false));

        let absent = MemoryGateway::primary().with_encryption(EncryptionState::Absent);
        let status = absent.execute(&Command::ServerStatus).unwrap().into_status().unwrap();
        assert!(status.lookup("encryptionAtRest").is_none());
    }
}
