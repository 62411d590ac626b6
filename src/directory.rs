// External collaborators consumed by the scheduling core.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduling::appointment::ResourceDimension;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub resource_id: Uuid,
    pub clinic_id: Uuid,
    pub dimension: ResourceDimension,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppointmentType {
    pub appointment_type_id: Uuid,
    pub clinic_id: Uuid,
    pub display_name: String,
    pub min_duration_min: i32,
    pub max_duration_min: i32,
    pub default_duration_min: i32,
    pub cleanup_buffer_min: i32,
    pub is_active: bool,
}

impl AppointmentType {
    pub fn allows(&self, duration_min: i32) -> bool {
        (self.min_duration_min..=self.max_duration_min).contains(&duration_min)
    }
}

/// Provider / chair / room identities and whether they can take bookings.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn is_active_provider(&self, provider_id: Uuid) -> Result<bool, StoreError>;
    async fn is_active_chair(&self, chair_id: Uuid) -> Result<bool, StoreError>;
    async fn is_active_room(&self, room_id: Uuid) -> Result<bool, StoreError>;
    /// Active chairs of a clinic.
    async fn chairs(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    /// Active rooms of a clinic.
    async fn rooms(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    /// Looks up a chair or room.
    async fn locate(&self, resource_id: Uuid) -> Result<Option<ResourceInfo>, StoreError>;
}

#[async_trait]
pub trait HolidayCalendar: Send + Sync {
    async fn is_closed(&self, clinic_id: Uuid, date: NaiveDate) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AppointmentTypeCatalog: Send + Sync {
    async fn appointment_type(&self, appointment_type_id: Uuid) -> Result<Option<AppointmentType>, StoreError>;
}

/* ============================================================
   In-memory directory (tests, database-less runs)
   ============================================================ */

#[derive(Default)]
struct DirectoryData {
    providers: HashMap<Uuid, (Uuid, bool)>,
    resources: HashMap<Uuid, ResourceInfo>,
    closures: BTreeSet<(Uuid, NaiveDate)>,
    types: HashMap<Uuid, AppointmentType>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    data: RwLock<DirectoryData>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&self, clinic_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.write().providers.insert(id, (clinic_id, true));
        id
    }

    pub fn add_chair(&self, clinic_id: Uuid) -> Uuid {
        self.add_resource(clinic_id, ResourceDimension::Chair)
    }

    pub fn add_room(&self, clinic_id: Uuid) -> Uuid {
        self.add_resource(clinic_id, ResourceDimension::Room)
    }

    fn add_resource(&self, clinic_id: Uuid, dimension: ResourceDimension) -> Uuid {
        let id = Uuid::new_v4();
        self.write().resources.insert(
            id,
            ResourceInfo {
                resource_id: id,
                clinic_id,
                dimension,
                is_active: true,
            },
        );
        id
    }

    /// Enables or disables a provider, chair or room.
    pub fn set_active(&self, id: Uuid, active: bool) {
        let mut data = self.write();
        if let Some(provider) = data.providers.get_mut(&id) {
            provider.1 = active;
        }
        if let Some(resource) = data.resources.get_mut(&id) {
            resource.is_active = active;
        }
    }

    pub fn add_closure(&self, clinic_id: Uuid, date: NaiveDate) {
        self.write().closures.insert((clinic_id, date));
    }

    pub fn add_appointment_type(
        &self,
        clinic_id: Uuid,
        name: &str,
        min_duration_min: i32,
        max_duration_min: i32,
        default_duration_min: i32,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.write().types.insert(
            id,
            AppointmentType {
                appointment_type_id: id,
                clinic_id,
                display_name: name.to_string(),
                min_duration_min,
                max_duration_min,
                default_duration_min,
                cleanup_buffer_min: 0,
                is_active: true,
            },
        );
        id
    }

    pub fn set_cleanup_buffer(&self, appointment_type_id: Uuid, minutes: i32) {
        if let Some(t) = self.write().types.get_mut(&appointment_type_id) {
            t.cleanup_buffer_min = minutes;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DirectoryData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DirectoryData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_of(&self, clinic_id: Uuid, dimension: ResourceDimension) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .read()
            .resources
            .values()
            .filter(|r| r.clinic_id == clinic_id && r.dimension == dimension && r.is_active)
            .map(|r| r.resource_id)
            .collect();
        ids.sort();
        ids
    }

    fn is_active_resource(&self, id: Uuid, dimension: ResourceDimension) -> bool {
        self.read()
            .resources
            .get(&id)
            .is_some_and(|r| r.dimension == dimension && r.is_active)
    }
}

#[async_trait]
impl ResourceDirectory for InMemoryDirectory {
    async fn is_active_provider(&self, provider_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.read().providers.get(&provider_id).is_some_and(|(_, active)| *active))
    }

    async fn is_active_chair(&self, chair_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.is_active_resource(chair_id, ResourceDimension::Chair))
    }

    async fn is_active_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.is_active_resource(room_id, ResourceDimension::Room))
    }

    async fn chairs(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.active_of(clinic_id, ResourceDimension::Chair))
    }

    async fn rooms(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.active_of(clinic_id, ResourceDimension::Room))
    }

    async fn locate(&self, resource_id: Uuid) -> Result<Option<ResourceInfo>, StoreError> {
        Ok(self.read().resources.get(&resource_id).copied())
    }
}

#[async_trait]
impl HolidayCalendar for InMemoryDirectory {
    async fn is_closed(&self, clinic_id: Uuid, date: NaiveDate) -> Result<bool, StoreError> {
        Ok(self.read().closures.contains(&(clinic_id, date)))
    }
}

#[async_trait]
impl AppointmentTypeCatalog for InMemoryDirectory {
    async fn appointment_type(&self, appointment_type_id: Uuid) -> Result<Option<AppointmentType>, StoreError> {
        Ok(self.read().types.get(&appointment_type_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deactivation_is_visible() {
        let dir = InMemoryDirectory::new();
        let clinic = Uuid::new_v4();
        let provider = dir.add_provider(clinic);
        let chair = dir.add_chair(clinic);
        let room = dir.add_room(clinic);

        assert!(dir.is_active_provider(provider).await.unwrap());
        assert!(dir.is_active_chair(chair).await.unwrap());
        assert!(!dir.is_active_chair(room).await.unwrap());
        assert_eq!(dir.chairs(clinic).await.unwrap(), vec![chair]);

        dir.set_active(provider, false);
        dir.set_active(chair, false);
        assert!(!dir.is_active_provider(provider).await.unwrap());
        assert!(dir.chairs(clinic).await.unwrap().is_empty());
        assert_eq!(dir.locate(chair).await.unwrap().map(|r| r.is_active), Some(false));
    }

    #[test]
    fn type_bounds_are_inclusive() {
        let t = AppointmentType {
            appointment_type_id: Uuid::nil(),
            clinic_id: Uuid::nil(),
            display_name: "Cleaning".into(),
            min_duration_min: 30,
            max_duration_min: 60,
            default_duration_min: 45,
            cleanup_buffer_min: 0,
            is_active: true,
        };
        assert!(t.allows(30));
        assert!(t.allows(60));
        assert!(!t.allows(29));
        assert!(!t.allows(61));
    }
}
