//! Plan generation — diff desired template state against recorded state.

use super::types::{
    PlanAction, PlannedChange, ResourceDecl, ResourceState, StackPlan, StackState, StackTemplate,
};

/// Generate a plan by comparing the template to the recorded stack state.
pub fn plan(
    stack: &str,
    template: &StackTemplate,
    creation_order: &[String],
    state: Option<&StackState>,
) -> StackPlan {
    let mut changes = Vec::new();
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut unchanged = 0u32;

    for resource_id in creation_order {
        let Some(resource) = template.resources.get(resource_id) else {
            continue;
        };

        let action = determine_action(resource_id, resource, state);
        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::NoOp => unchanged += 1,
            PlanAction::Destroy => {}
        }

        changes.push(PlannedChange {
            resource_id: resource_id.clone(),
            resource_type: resource.resource_type.clone(),
            action,
            description: describe_action(resource_id, resource, action),
        });
    }

    StackPlan {
        stack: stack.to_string(),
        changes,
        creation_order: creation_order.to_vec(),
        to_create,
        to_update,
        to_destroy: 0,
        unchanged,
    }
}

/// Determine what action to take for one resource.
fn determine_action(
    resource_id: &str,
    resource: &ResourceDecl,
    state: Option<&StackState>,
) -> PlanAction {
    let Some(record) = state.and_then(|s| s.resources.get(resource_id)) else {
        return PlanAction::Create;
    };

    if record.status == ResourceState::Created && record.physical_id.is_some() {
        if record.properties_hash == properties_hash(resource) {
            return PlanAction::NoOp;
        }
        return PlanAction::Update;
    }

    // A failed record that still points at a physical resource retries in
    // place; anything else re-creates
    if record.physical_id.is_some() {
        return PlanAction::Update;
    }
    PlanAction::Create
}

/// BLAKE3 hash over the resource type and its declared (unresolved) property
/// expressions, canonically serialized. Computable before provisioning, so
/// plans never need provider contact.
pub fn properties_hash(resource: &ResourceDecl) -> String {
    let canonical = serde_yaml_ng::to_string(&(&resource.resource_type, &resource.properties))
        .unwrap_or_default();
    format!("blake3:{}", blake3::hash(canonical.as_bytes()).to_hex())
}

fn describe_action(resource_id: &str, resource: &ResourceDecl, action: PlanAction) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", resource_id, resource.resource_type),
        PlanAction::Update => format!("{}: update (declared properties changed)", resource_id),
        PlanAction::Destroy => format!("{}: destroy", resource_id),
        PlanAction::NoOp => format!("{}: no changes", resource_id),
    }
}
