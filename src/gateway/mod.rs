//! Command gateway: the boundary between the pipeline and the deployment.
//!
//! Every administrative and data operation goes through
//! [`CommandGateway::execute`]. The gateway never retries; only the caller
//! knows whether repeating a command is safe.

pub mod memory;
pub mod mongo;

pub use memory::{EncryptionState, MemoryGateway};
pub use mongo::MongoGateway;

use crate::core::error::{GatewayResult, TdeResult};
use crate::core::types::{Namespace, StatusSnapshot};
use log::info;
use mongodb::bson::{Bson, Document};
use serde::Serialize;
use std::fmt;

/// A command sent to the deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `replSetGetStatus`.
    ReplicaSetStatus,
    /// `replSetInitiate` with the given configuration document.
    ReplicaSetInitiate {
        /// Replica set configuration (`_id`, `members`).
        config: Document,
    },
    /// `serverStatus`.
    ServerStatus,
    /// Insert documents into a collection.
    Insert {
        /// Target collection.
        namespace: Namespace,
        /// Documents to insert.
        documents: Vec<Document>,
    },
    /// Fetch at most one document matching a filter.
    FindOne {
        /// Target collection.
        namespace: Namespace,
        /// Query filter.
        filter: Document,
    },
    /// Run an aggregation pipeline.
    Aggregate {
        /// Target collection.
        namespace: Namespace,
        /// Pipeline stages.
        pipeline: Vec<Document>,
    },
    /// Update the first document matching a filter.
    UpdateOne {
        /// Target collection.
        namespace: Namespace,
        /// Query filter.
        filter: Document,
        /// Update operators.
        update: Document,
    },
    /// Storage statistics of a collection.
    CollectionStats {
        /// Target collection.
        namespace: Namespace,
    },
    /// Delete every document matching a filter.
    DeleteMany {
        /// Target collection.
        namespace: Namespace,
        /// Query filter.
        filter: Document,
    },
    /// Drop a collection.
    DropCollection {
        /// Target collection.
        namespace: Namespace,
    },
    /// Drop a database.
    DropDatabase {
        /// Database name.
        database: String,
    },
}

/// The kind of a [`Command`], without its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// `replSetGetStatus`.
    ReplicaSetStatus,
    /// `replSetInitiate`.
    ReplicaSetInitiate,
    /// `serverStatus`.
    ServerStatus,
    /// Insert.
    Insert,
    /// Find one.
    FindOne,
    /// Aggregate.
    Aggregate,
    /// Update one.
    UpdateOne,
    /// Collection statistics.
    CollectionStats,
    /// Delete many.
    DeleteMany,
    /// Drop collection.
    DropCollection,
    /// Drop database.
    DropDatabase,
}

impl CommandKind {
    /// Whether commands of this kind remove scratch state.
    pub fn is_cleanup(&self) -> bool {
        matches!(
            self,
            CommandKind::DeleteMany | CommandKind::DropCollection | CommandKind::DropDatabase
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::ReplicaSetStatus => "replSetGetStatus",
            CommandKind::ReplicaSetInitiate => "replSetInitiate",
            CommandKind::ServerStatus => "serverStatus",
            CommandKind::Insert => "insert",
            CommandKind::FindOne => "findOne",
            CommandKind::Aggregate => "aggregate",
            CommandKind::UpdateOne => "updateOne",
            CommandKind::CollectionStats => "collStats",
            CommandKind::DeleteMany => "deleteMany",
            CommandKind::DropCollection => "dropCollection",
            CommandKind::DropDatabase => "dropDatabase",
        };
        f.write_str(name)
    }
}

impl Command {
    /// The kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ReplicaSetStatus => CommandKind::ReplicaSetStatus,
            Command::ReplicaSetInitiate { .. } => CommandKind::ReplicaSetInitiate,
            Command::ServerStatus => CommandKind::ServerStatus,
            Command::Insert { .. } => CommandKind::Insert,
            Command::FindOne { .. } => CommandKind::FindOne,
            Command::Aggregate { .. } => CommandKind::Aggregate,
            Command::UpdateOne { .. } => CommandKind::UpdateOne,
            Command::CollectionStats { .. } => CommandKind::CollectionStats,
            Command::DeleteMany { .. } => CommandKind::DeleteMany,
            Command::DropCollection { .. } => CommandKind::DropCollection,
            Command::DropDatabase { .. } => CommandKind::DropDatabase,
        }
    }

    /// The collection this command targets, if any.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Command::Insert { namespace, .. }
            | Command::FindOne { namespace, .. }
            | Command::Aggregate { namespace, .. }
            | Command::UpdateOne { namespace, .. }
            | Command::CollectionStats { namespace }
            | Command::DeleteMany { namespace, .. }
            | Command::DropCollection { namespace } => Some(namespace),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.namespace(), self) {
            (Some(namespace), _) => write!(f, "{} on {}", self.kind(), namespace),
            (None, Command::DropDatabase { database }) => {
                write!(f, "{} on {}", self.kind(), database)
            }
            (None, _) => write!(f, "{}", self.kind()),
        }
    }
}

/// Storage statistics of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CollectionStats {
    /// Number of documents.
    pub count: u64,
    /// Storage size in bytes.
    pub storage_size: u64,
    /// Average document size in bytes.
    pub avg_obj_size: u64,
}

/// Structured result of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No result body.
    None,
    /// A status reply.
    Status(StatusSnapshot),
    /// Identifiers of inserted documents, in insertion order.
    Inserted {
        /// Inserted `_id` values.
        ids: Vec<Bson>,
    },
    /// Result of a point query.
    Document(Option<Document>),
    /// Result documents of an aggregation.
    Documents(Vec<Document>),
    /// Result of an update.
    Updated {
        /// Documents matched by the filter.
        matched: u64,
        /// Documents actually modified.
        modified: u64,
    },
    /// Result of a delete.
    Deleted {
        /// Documents removed.
        count: u64,
    },
    /// Collection statistics.
    Stats(CollectionStats),
}

/// Reply of a command gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Whether the deployment acknowledged the command.
    pub acknowledged: bool,
    /// Result body.
    pub payload: Payload,
}

impl Response {
    /// An acknowledged response.
    pub fn ack(payload: Payload) -> Self {
        Self {
            acknowledged: true,
            payload,
        }
    }

    /// An unacknowledged response.
    pub fn unacknowledged(payload: Payload) -> Self {
        Self {
            acknowledged: false,
            payload,
        }
    }

    /// The status snapshot carried by this response.
    pub fn into_status(self) -> Option<StatusSnapshot> {
        match self.payload {
            Payload::Status(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// Inserted identifiers carried by this response.
    pub fn inserted_ids(&self) -> Option<&[Bson]> {
        match &self.payload {
            Payload::Inserted { ids } => Some(ids),
            _ => None,
        }
    }

    /// The point-query result carried by this response.
    pub fn into_document(self) -> Option<Option<Document>> {
        match self.payload {
            Payload::Document(document) => Some(document),
            _ => None,
        }
    }

    /// Aggregation results carried by this response.
    pub fn into_documents(self) -> Option<Vec<Document>> {
        match self.payload {
            Payload::Documents(documents) => Some(documents),
            _ => None,
        }
    }
}

/// Boundary adapter to the external deployment.
///
/// Implementations translate [`Command`]s into their wire protocol and map
/// every failure onto the closed [`GatewayError`](crate::core::GatewayError)
/// enumeration.
pub trait CommandGateway: Send + Sync {
    /// Execute one command.
    fn execute(&self, command: &Command) -> GatewayResult<Response>;
}

impl<G: CommandGateway + ?Sized> CommandGateway for &G {
    fn execute(&self, command: &Command) -> GatewayResult<Response> {
        (**self).execute(command)
    }
}

impl<G: CommandGateway + ?Sized> CommandGateway for std::sync::Arc<G> {
    fn execute(&self, command: &Command) -> GatewayResult<Response> {
        (**self).execute(command)
    }
}

/// Open a gateway to `uri`, or to a fresh simulated deployment that has not
/// been initiated yet.
pub fn open(uri: &str, simulated: bool) -> TdeResult<Box<dyn CommandGateway>> {
    if simulated {
        info!("using the simulated deployment");
        return Ok(Box::new(MemoryGateway::uninitialized(2)));
    }
    Ok(Box::new(MongoGateway::connect(uri)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GatewayError, TdeError};
    use mongodb::bson::doc;

    #[test]
    fn test_open_simulated_deployment() {
        let gateway = open("mongodb://unused", true).unwrap();
        assert!(matches!(
            gateway.execute(&Command::ReplicaSetStatus),
            Err(GatewayError::NotYetInitialized { .. })
        ));
    }

    #[test]
    fn test_open_rejects_malformed_uri() {
        let result = open("not a connection string", false);
        assert!(matches!(result, Err(TdeError::Gateway(GatewayError::Transport { .. }))));
    }

    #[test]
    fn test_command_display() {
        let namespace = Namespace::new("TDE_TestDB", "EncryptedCollection");
        let find = Command::FindOne {
            namespace,
            filter: doc! { "_id": 1 },
        };
        assert_eq!(find.to_string(), "findOne on TDE_TestDB.EncryptedCollection");
        assert_eq!(Command::ServerStatus.to_string(), "serverStatus");
        assert_eq!(
            Command::DropDatabase { database: "TDE_TestDB".into() }.to_string(),
            "dropDatabase on TDE_TestDB"
        );
    }

    #[test]
    fn test_response_accessors() {
        let response = Response::ack(Payload::Inserted { ids: vec![Bson::Int32(1)] });
        assert_eq!(response.inserted_ids(), Some(&[Bson::Int32(1)][..]));
        assert!(response.into_status().is_none());
    }

    #[test]
    fn test_cleanup_kinds() {
        assert!(CommandKind::DropDatabase.is_cleanup());
        assert!(CommandKind::DeleteMany.is_cleanup());
        assert!(!CommandKind::Insert.is_cleanup());
    }
}
