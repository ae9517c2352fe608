use super::context::ProcessingContext;
use crate::error::{HandlerResult, ProcessingError};
use crate::model::{validate_model, ProcessDefinition};
use crate::record::{DeploymentRecord, RecordValue, RejectionType};
use crate::types::{DeploymentIntent, Intent};

/// Deploys a process model. Redeploying an unchanged model keeps the latest
/// version and answers with the existing definition.
pub fn create(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let deployment = ctx
        .record
        .value
        .as_deployment()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("deployment command without a deployment value"))?;

    let errors = validate_model(&deployment.model);
    if !errors.is_empty() {
        let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(ProcessingError::rejected(
            RejectionType::InvalidArgument,
            format!(
                "Expected to deploy a valid process '{}', but it has errors: {}",
                deployment.model.id,
                reasons.join("; ")
            ),
        ));
    }

    let digest = deployment.model.digest();
    let latest = ctx.state.definitions.latest(&deployment.model.id);
    let mut created = DeploymentRecord::new(deployment.model);
    created.digest = digest.clone();

    match latest {
        Some(latest) if latest.digest == digest => {
            created.process_definition_key = latest.key;
            created.version = latest.version;
            created.duplicate = true;
        }
        previous => {
            let key = ctx.next_key();
            let version = previous.map(|d| d.version + 1).unwrap_or(1);
            ctx.state.definitions.put(ProcessDefinition::new(
                key,
                version,
                digest,
                created.model.clone(),
            ));
            created.process_definition_key = key;
            created.version = version;
            tracing::info!(
                bpmn_process_id = %created.model.id,
                process_definition_key = key,
                version,
                "Deployment: new process version"
            );
        }
    }

    ctx.writer.append_event(
        created.process_definition_key,
        Intent::Deployment(DeploymentIntent::Created),
        RecordValue::Deployment(created),
    )
}
