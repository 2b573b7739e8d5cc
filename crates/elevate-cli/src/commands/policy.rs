use super::{CliContext, load_registry};
use crate::cli::PolicyCommands;
use crate::output::{print_json, status_label, table};
use anyhow::{Result, bail};
use comfy_table::Cell;
use elevate_contracts::Action;
use elevate_core::daemon::user_identity;
use elevate_core::policy::{DecisionSource, PolicyDecision, PolicyEvaluator, StoreState};
use elevate_core::HelperRegistry;
use elevate_core::snapshot::SharedSnapshot;
use serde_json::json;
use std::sync::Arc;

pub fn run(ctx: &CliContext, command: PolicyCommands) -> Result<()> {
    match command {
        PolicyCommands::Check { action, uid } => check(ctx, action, uid),
        PolicyCommands::List => list(ctx),
    }
}

fn open_evaluator(ctx: &CliContext) -> Result<(PolicyEvaluator, Arc<HelperRegistry>)> {
    let config = ctx.load_config()?;
    let registry = Arc::new(SharedSnapshot::new(load_registry(&config)?));
    let evaluator = PolicyEvaluator::open(config.resolve_policy_path()?, registry.clone());
    Ok((evaluator, registry.load()))
}

fn check(ctx: &CliContext, action: String, uid: Option<u32>) -> Result<()> {
    let (evaluator, _) = open_evaluator(ctx)?;
    let uid = uid.unwrap_or_else(|| nix::unistd::getuid().as_raw());
    let identity = user_identity(uid);
    let action = Action::new(action);
    let decision = evaluator.evaluate_detailed(&identity, &action);

    if ctx.format.is_json() {
        return print_json(&json!({
            "action": action.name,
            "uid": uid,
            "decision": decision,
        }));
    }

    println!(
        "{} for uid {uid}: {}",
        action.name,
        status_label(decision.status)
    );
    println!("  {}", explain(&decision));
    Ok(())
}

fn explain(decision: &PolicyDecision) -> String {
    let source = match &decision.source {
        DecisionSource::Rule(pattern) => format!("policy entry '{pattern}'"),
        DecisionSource::ManifestDefault => "helper manifest default".to_string(),
        DecisionSource::Fallback => "no matching entry".to_string(),
        DecisionSource::StoreUnavailable => "policy store unreadable".to_string(),
    };
    match decision.requirement {
        Some(requirement) if decision.keep => format!(
            "decided by {source}; {} authentication, remembered",
            requirement.as_str()
        ),
        Some(requirement) => format!(
            "decided by {source}; {} authentication",
            requirement.as_str()
        ),
        None => format!("decided by {source}"),
    }
}

fn list(ctx: &CliContext) -> Result<()> {
    let (evaluator, registry) = open_evaluator(ctx)?;
    let store = evaluator.store();
    let store = match &*store {
        StoreState::Ready(store) => store,
        StoreState::Unavailable(reason) => bail!("Policy store is unreadable: {reason}"),
    };
    let mut defaults = Vec::new();
    for helper in registry.helpers() {
        for action in &helper.actions {
            if let Some(policy) = action.policy {
                defaults.push((action.name.clone(), helper.id.clone(), policy.to_string()));
            }
        }
    }
    defaults.sort();

    if ctx.format.is_json() {
        let entries: Vec<_> = store
            .entries()
            .iter()
            .map(|entry| {
                json!({
                    "pattern": entry.pattern.to_string(),
                    "scope": entry.scope.as_ref().map(|scope| scope.to_string()),
                    "result": entry.value.to_string(),
                })
            })
            .collect();
        let defaults: Vec<_> = defaults
            .iter()
            .map(|(action, helper, policy)| {
                json!({ "action": action, "helper": helper, "result": policy })
            })
            .collect();
        return print_json(&json!({
            "path": evaluator.path(),
            "entries": entries,
            "manifest_defaults": defaults,
        }));
    }

    println!("Policy store: {}", evaluator.path().display());
    if store.is_empty() {
        println!("No policy entries.");
    } else {
        let mut entries = table(vec!["Pattern", "Applies To", "Result"]);
        for entry in store.entries() {
            let scope = entry
                .scope
                .as_ref()
                .map(|scope| scope.to_string())
                .unwrap_or_else(|| "everyone (default)".to_string());
            entries.add_row(vec![
                Cell::new(entry.pattern.to_string()),
                Cell::new(scope),
                Cell::new(entry.value.to_string()),
            ]);
        }
        println!("{entries}");
    }

    if !defaults.is_empty() {
        println!("\nHelper defaults");
        let mut manifest = table(vec!["Action", "Helper", "Result"]);
        for (action, helper, policy) in defaults {
            manifest.add_row(vec![action, helper, policy]);
        }
        println!("{manifest}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elevate_contracts::AuthorizationStatus;
    use elevate_core::policy::AuthRequirement;

    #[test]
    fn test_explain_mentions_source_and_requirement() {
        let decision = PolicyDecision {
            status: AuthorizationStatus::AuthRequired,
            requirement: Some(AuthRequirement::AdminAuth),
            keep: true,
            source: DecisionSource::Rule("org.example.*".to_string()),
        };
        assert_eq!(
            explain(&decision),
            "decided by policy entry 'org.example.*'; admin authentication, remembered"
        );

        let denied = PolicyDecision {
            status: AuthorizationStatus::Denied,
            requirement: None,
            keep: false,
            source: DecisionSource::StoreUnavailable,
        };
        assert_eq!(explain(&denied), "decided by policy store unreadable");
    }
}
