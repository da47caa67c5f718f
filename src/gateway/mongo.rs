//! Production gateway over the MongoDB synchronous driver.

use crate::core::error::{GatewayError, GatewayResult, NOT_YET_INITIALIZED_CODE};
use crate::core::types::{as_i64, Namespace, StatusSnapshot};
use crate::gateway::{CollectionStats, Command, CommandGateway, Payload, Response};
use log::debug;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::sync::{Client, Collection, Database};

/// Gateway that executes commands against a live deployment.
pub struct MongoGateway {
    client: Client,
}

impl MongoGateway {
    /// Connect using a MongoDB connection string.
    ///
    /// The driver connects lazily, so an unreachable server surfaces as a
    /// transport error on the first command rather than here.
    pub fn connect(uri: &str) -> GatewayResult<Self> {
        let client = Client::with_uri_str(uri)?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn admin(&self) -> Database {
        self.client.database("admin")
    }

    fn collection(&self, namespace: &Namespace) -> Collection<Document> {
        self.client
            .database(&namespace.database)
            .collection(&namespace.collection)
    }

    fn admin_command(&self, command: Document) -> GatewayResult<Document> {
        Ok(self.admin().run_command(command).run()?)
    }

    fn collection_stats(&self, namespace: &Namespace) -> GatewayResult<CollectionStats> {
        let pipeline = vec![doc! { "$collStats": { "storageStats": {} } }];
        let mut cursor = self.collection(namespace).aggregate(pipeline).run()?;
        let reply = match cursor.next() {
            Some(document) => document?,
            None => return Ok(CollectionStats { count: 0, storage_size: 0, avg_obj_size: 0 }),
        };
        let storage = reply.get_document("storageStats").cloned().unwrap_or_default();
        let number = |field: &str| {
            storage
                .get(field)
                .and_then(as_i64)
                .map(|value| value.max(0) as u64)
                .unwrap_or(0)
        };
        Ok(CollectionStats {
            count: number("count"),
            storage_size: number("storageSize"),
            avg_obj_size: number("avgObjSize"),
        })
    }
}

fn reply_ok(reply: &Document) -> bool {
    reply
        .get("ok")
        .and_then(crate::core::types::as_f64)
        .is_some_and(|ok| ok == 1.0)
}

impl CommandGateway for MongoGateway {
    fn execute(&self, command: &Command) -> GatewayResult<Response> {
        debug!("executing {}", command);

        let response = match command {
            Command::ReplicaSetStatus => {
                let reply = self.admin_command(doc! { "replSetGetStatus": 1 })?;
                Response::ack(Payload::Status(StatusSnapshot::new(reply)))
            }
            Command::ReplicaSetInitiate { config } => {
                let reply = self.admin_command(doc! { "replSetInitiate": config.clone() })?;
                Response {
                    acknowledged: reply_ok(&reply),
                    payload: Payload::Status(StatusSnapshot::new(reply)),
                }
            }
            Command::ServerStatus => {
                let reply = self.admin_command(doc! { "serverStatus": 1 })?;
                Response::ack(Payload::Status(StatusSnapshot::new(reply)))
            }
            Command::Insert { namespace, documents } => {
                if documents.is_empty() {
                    return Ok(Response::ack(Payload::Inserted { ids: Vec::new() }));
                }
                let result = self.collection(namespace).insert_many(documents.iter()).run()?;
                let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(index, _)| *index);
                let ids: Vec<Bson> = ids.into_iter().map(|(_, id)| id).collect();
                Response {
                    acknowledged: ids.len() == documents.len(),
                    payload: Payload::Inserted { ids },
                }
            }
            Command::FindOne { namespace, filter } => {
                let found = self.collection(namespace).find_one(filter.clone()).run()?;
                Response::ack(Payload::Document(found))
            }
            Command::Aggregate { namespace, pipeline } => {
                let cursor = self.collection(namespace).aggregate(pipeline.clone()).run()?;
                let documents = cursor.collect::<Result<Vec<_>, _>>()?;
                Response::ack(Payload::Documents(documents))
            }
            Command::UpdateOne {
                namespace,
                filter,
                update,
            } => {
                let result = self
                    .collection(namespace)
                    .update_one(filter.clone(), update.clone())
                    .run()?;
                Response::ack(Payload::Updated {
                    matched: result.matched_count,
                    modified: result.modified_count,
                })
            }
            Command::CollectionStats { namespace } => {
                Response::ack(Payload::Stats(self.collection_stats(namespace)?))
            }
            Command::DeleteMany { namespace, filter } => {
                let result = self.collection(namespace).delete_many(filter.clone()).run()?;
                Response::ack(Payload::Deleted {
                    count: result.deleted_count,
                })
            }
            Command::DropCollection { namespace } => {
                self.collection(namespace).drop().run()?;
                Response::ack(Payload::None)
            }
            Command::DropDatabase { database } => {
                self.client.database(database).drop().run()?;
                Response::ack(Payload::None)
            }
        };

        Ok(response)
    }
}

impl From<MongoError> for GatewayError {
    fn from(error: MongoError) -> Self {
        match error.kind.as_ref() {
            ErrorKind::Command(command) if command.code == NOT_YET_INITIALIZED_CODE => {
                GatewayError::not_yet_initialized(command.message.clone())
            }
            ErrorKind::Command(command) => GatewayError::rejected(
                command.code,
                command.code_name.clone(),
                command.message.clone(),
            ),
            ErrorKind::Write(_) | ErrorKind::InsertMany(_) => {
                GatewayError::rejected(0, "WriteError", error.to_string())
            }
            _ => GatewayError::transport(error.to_string()),
        }
    }
}
