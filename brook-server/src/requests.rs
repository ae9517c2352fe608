//! JSON-lines client protocol on stdin/stdout.
//!
//! One request per line, tagged by `op`:
//!
//! ```text
//! {"id":"r1","op":"create_instance","bpmn_process_id":"order","variables":{"total":12}}
//! {"op":"activate_jobs","job_type":"charge","worker":"w1","timeout_ms":30000,"max_jobs":10}
//! ```
//!
//! Requests without an `id` get a generated one. Every request produces exactly
//! one response line carrying the same id.

use brook_core::partition::ClientError;
use brook_core::record::{UpdateSemantics, VariableMap};
use brook_core::{Key, PartitionClient, ProcessModel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientCommand {
    Deploy {
        model: ProcessModel,
    },
    DeployFile {
        path: PathBuf,
    },
    CreateInstance {
        bpmn_process_id: String,
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        variables: VariableMap,
    },
    CancelInstance {
        key: Key,
    },
    TerminateElement {
        key: Key,
    },
    ActivateJobs {
        job_type: String,
        worker: String,
        timeout_ms: i64,
        max_jobs: u32,
    },
    CompleteJob {
        key: Key,
        #[serde(default)]
        variables: VariableMap,
    },
    FailJob {
        key: Key,
        retries: u32,
        #[serde(default)]
        error_message: String,
    },
    UpdateRetries {
        key: Key,
        retries: u32,
    },
    ResolveIncident {
        key: Key,
    },
    SetVariables {
        scope_key: Key,
        variables: VariableMap,
        #[serde(default)]
        local: bool,
    },
    ListIncidents {
        process_instance_key: Key,
    },
    ProcessInstance {
        key: Key,
    },
    Health,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientResponse {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClientResponse {
    pub fn success(id: String, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: String, error: impl ToString) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Parses one line. A line that is not a valid request still gets an answer.
pub fn parse_line(line: &str) -> Result<ClientRequest, ClientResponse> {
    serde_json::from_str(line).map_err(|e| {
        // Echo the id if the line at least carries one.
        let id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(new_request_id);
        ClientResponse::failure(id, format!("invalid request: {e}"))
    })
}

pub fn new_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub async fn execute(client: &PartitionClient, request: ClientRequest) -> ClientResponse {
    let id = request.id.unwrap_or_else(new_request_id);
    tracing::debug!(request_id = %id, command = ?request.command, "Request received");
    match run(client, request.command).await {
        Ok(result) => ClientResponse::success(id, result),
        Err(e) if is_rejection(&e) => {
            tracing::debug!(request_id = %id, error = %e, "Request rejected");
            ClientResponse::failure(id, e)
        }
        Err(e) => {
            tracing::warn!(request_id = %id, error = %e, "Request failed");
            ClientResponse::failure(id, e)
        }
    }
}

async fn run(client: &PartitionClient, command: ClientCommand) -> anyhow::Result<Value> {
    let result = match command {
        ClientCommand::Deploy { model } => serde_json::to_value(client.deploy(model).await?)?,
        ClientCommand::DeployFile { path } => {
            let content = tokio::fs::read_to_string(&path).await?;
            let model = ProcessModel::from_yaml(&content)?;
            serde_json::to_value(client.deploy(model).await?)?
        }
        ClientCommand::CreateInstance {
            bpmn_process_id,
            version,
            variables,
        } => {
            let key = client
                .create_instance(&bpmn_process_id, version, variables)
                .await?;
            json!({ "process_instance_key": key })
        }
        ClientCommand::CancelInstance { key } => {
            client.cancel_instance(key).await?;
            json!({})
        }
        ClientCommand::TerminateElement { key } => {
            client.terminate_element(key).await?;
            json!({})
        }
        ClientCommand::ActivateJobs {
            job_type,
            worker,
            timeout_ms,
            max_jobs,
        } => {
            let batch = client
                .activate_jobs(&job_type, &worker, timeout_ms, max_jobs)
                .await?;
            let jobs: Vec<Value> = batch
                .job_keys
                .iter()
                .zip(&batch.jobs)
                .map(|(key, job)| json!({ "key": key, "job": job }))
                .collect();
            json!({ "jobs": jobs })
        }
        ClientCommand::CompleteJob { key, variables } => {
            client.complete_job(key, variables).await?;
            json!({})
        }
        ClientCommand::FailJob {
            key,
            retries,
            error_message,
        } => {
            client.fail_job(key, retries, &error_message).await?;
            json!({})
        }
        ClientCommand::UpdateRetries { key, retries } => {
            client.update_retries(key, retries).await?;
            json!({})
        }
        ClientCommand::ResolveIncident { key } => {
            client.resolve_incident(key).await?;
            json!({})
        }
        ClientCommand::SetVariables {
            scope_key,
            variables,
            local,
        } => {
            let semantics = if local {
                UpdateSemantics::Local
            } else {
                UpdateSemantics::Propagate
            };
            client.set_variables(scope_key, variables, semantics).await?;
            json!({})
        }
        ClientCommand::ListIncidents {
            process_instance_key,
        } => serde_json::to_value(client.list_incidents(process_instance_key).await?)?,
        ClientCommand::ProcessInstance { key } => {
            serde_json::to_value(client.process_instance(key).await?)?
        }
        ClientCommand::Health => json!({ "health": format!("{:?}", client.health()) }),
    };
    Ok(result)
}

/// Rejections are expected answers, not server errors.
pub fn is_rejection(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<ClientError>(), Some(ClientError::Rejected(_)))
}
