use crate::{ContractError, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Employee,
    Manager,
    Clinic,
    Admin,
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Employee => "employee",
            ActorRole::Manager => "manager",
            ActorRole::Clinic => "clinic",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }

    /// Roles whose row visibility is limited to one tenant.
    pub fn is_tenant_scoped(&self) -> bool {
        !matches!(self, ActorRole::Admin | ActorRole::System)
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorRole {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "employee" => Ok(ActorRole::Employee),
            "manager" => Ok(ActorRole::Manager),
            "clinic" => Ok(ActorRole::Clinic),
            "admin" => Ok(ActorRole::Admin),
            "system" => Ok(ActorRole::System),
            other => Err(ContractError::UnknownVariant {
                kind: "actor role",
                value: other.to_string(),
            }),
        }
    }
}

/// Who is acting, and on which tenant's rows.
///
/// Built once at the start of a use case and passed down explicitly. The
/// storage layer installs it into every transaction before running any
/// tenant-scoped statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    actor_cpf: String,
    role: ActorRole,
    tenant_id: Option<TenantId>,
    elevated_label: Option<String>,
}

impl SecurityContext {
    pub fn new(actor_cpf: impl Into<String>, role: ActorRole, tenant_id: Option<TenantId>) -> Self {
        Self {
            actor_cpf: actor_cpf.into(),
            role,
            tenant_id,
            elevated_label: None,
        }
    }

    /// Elevated context for jobs that act on behalf of no particular user.
    /// The label names the job in logs and attribution.
    pub fn system(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            actor_cpf: format!("system:{label}"),
            role: ActorRole::System,
            tenant_id: None,
            elevated_label: Some(label),
        }
    }

    pub fn actor_cpf(&self) -> &str {
        &self.actor_cpf
    }

    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn elevated_label(&self) -> Option<&str> {
        self.elevated_label.as_deref()
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated_label.is_some()
    }
}

impl fmt::Display for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.elevated_label, self.tenant_id) {
            (Some(label), _) => write!(f, "{}[elevated:{label}]", self.role),
            (None, Some(tenant)) => write!(f, "{}:{}@{tenant}", self.role, self.actor_cpf),
            (None, None) => write!(f, "{}:{}", self.role, self.actor_cpf),
        }
    }
}
