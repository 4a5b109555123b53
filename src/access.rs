//! Access-control checks for stored entries.
//!
//! Owners may always read and write. `Team` entries are open to agents the
//! registry places on the owner's team, `Public` entries to everyone. The
//! maintenance identity bypasses checks so sweeps can remove any entry.
use crate::error::{SwarmError, SwarmResult};
use crate::registry::AgentRegistry;
use crate::types::{Acl, OpContext, Visibility};

/// Operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Retrieve or query
    Read,
    /// Overwrite
    Write,
    /// Remove
    Delete,
}

impl Operation {
    /// Verb used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
        }
    }
}

/// Whether `caller` passes `acl`.
pub fn is_allowed(acl: &Acl, caller: &str, registry: &dyn AgentRegistry) -> bool {
    if caller == acl.owner_id || caller == crate::types::SYSTEM_AGENT {
        return true;
    }
    match acl.visibility {
        Visibility::Public => true,
        Visibility::Team => registry.same_team(caller, &acl.owner_id),
        Visibility::Private => false,
    }
}

/// Authorize `operation` on `partition/key`, failing with `AccessDenied`.
pub fn authorize(
    acl: &Acl,
    ctx: &OpContext,
    registry: &dyn AgentRegistry,
    operation: Operation,
    partition: &str,
    key: &str,
) -> SwarmResult<()> {
    if is_allowed(acl, &ctx.caller, registry) {
        Ok(())
    } else {
        tracing::debug!(
            caller = %ctx.caller,
            owner = %acl.owner_id,
            visibility = %acl.visibility,
            operation = operation.as_str(),
            "Access denied"
        );
        Err(SwarmError::AccessDenied {
            agent_id: ctx.caller.clone(),
            partition: partition.to_string(),
            key: key.to_string(),
            operation: operation.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentDescriptor, InMemoryAgentRegistry};

    fn registry() -> InMemoryAgentRegistry {
        let r = InMemoryAgentRegistry::new();
        r.register(AgentDescriptor::new("owner", "tester"));
        r.register(AgentDescriptor::new("mate", "tester"));
        r.register(AgentDescriptor::new("stranger", "analyzer"));
        r
    }

    #[test]
    fn test_private_is_owner_only() {
        let r = registry();
        let acl = Acl::private("owner");
        assert!(is_allowed(&acl, "owner", &r));
        assert!(!is_allowed(&acl, "mate", &r));
        assert!(!is_allowed(&acl, "stranger", &r));
        assert!(is_allowed(&acl, crate::types::SYSTEM_AGENT, &r));
    }

    #[test]
    fn test_team_includes_teammates() {
        let r = registry();
        let acl = Acl::team("owner");
        assert!(is_allowed(&acl, "mate", &r));
        assert!(!is_allowed(&acl, "stranger", &r));
    }

    #[test]
    fn test_public_is_open() {
        let r = registry();
        assert!(is_allowed(&Acl::public("owner"), "stranger", &r));
        assert!(is_allowed(&Acl::public("owner"), "unregistered", &r));
    }

    #[test]
    fn test_authorize_reports_operation() {
        let r = registry();
        let err = authorize(
            &Acl::private("owner"),
            &OpContext::new("stranger"),
            &r,
            Operation::Delete,
            "p",
            "k",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SwarmError::AccessDenied { operation: "delete", .. }
        ));
    }
}
