use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// who is asking, carried through every operation and across peer RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub is_admin: bool,
}

impl RequestContext {
    /// admin context, bypasses ownership checks
    pub fn admin() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            project_id: None,
            user_id: None,
            is_admin: true,
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            project_id: Some(project_id.into()),
            user_id: None,
            is_admin: false,
        }
    }
}
