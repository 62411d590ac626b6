use std::sync::Arc;

use serde::Serialize;

use crate::middleware::auth_context::SessionResolver;
use crate::scheduling::SchedulingCore;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<SchedulingCore>,
    pub sessions: Arc<dyn SessionResolver>,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

impl<T> ApiOk<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/* -------------------------
   Roles
--------------------------*/

/// Role mapping of dcms_user.roles:
/// 0 Patient, 1 Admin, 2 Manager, 3 Doctor, 4 Receptionist
pub const ROLE_PATIENT: i16 = 0;
pub const ROLE_ADMIN: i16 = 1;
pub const ROLE_MANAGER: i16 = 2;
pub const ROLE_DOCTOR: i16 = 3;
pub const ROLE_RECEPTIONIST: i16 = 4;

pub fn role_to_string(role: i16) -> &'static str {
    match role {
        ROLE_PATIENT => "patient",
        ROLE_ADMIN => "admin",
        ROLE_MANAGER => "manager",
        ROLE_DOCTOR => "doctor",
        ROLE_RECEPTIONIST => "receptionist",
        _ => "unknown",
    }
}
