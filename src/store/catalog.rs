use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::repo::{Catalog, RepoError};

use super::Store;

fn check_name(name: &str) -> Result<(), RepoError> {
    if name.len() > MAX_NAME_LEN {
        return Err(RepoError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Store {
    // ── Catalog writes ───────────────────────────────────────
    //
    // Thin upserts; the engine only ever reads the catalog.

    pub async fn save_business(&self, settings: BusinessSettings) -> Result<(), RepoError> {
        if let Some(name) = &settings.name {
            check_name(name)?;
        }
        if settings.buffer_minutes > MAX_BUFFER_MINUTES {
            return Err(RepoError::LimitExceeded("buffer too long"));
        }
        if settings.max_advance_days > MAX_ADVANCE_DAYS {
            return Err(RepoError::LimitExceeded("booking horizon too far"));
        }
        if !(MIN_GRANULARITY_MINUTES..=MAX_GRANULARITY_MINUTES)
            .contains(&settings.granularity_minutes)
        {
            return Err(RepoError::Invalid(format!(
                "granularity {} minutes",
                settings.granularity_minutes
            )));
        }
        if !self.businesses.contains_key(&settings.id) && self.businesses.len() >= MAX_BUSINESSES {
            return Err(RepoError::LimitExceeded("too many businesses"));
        }
        self.persist_catalog(Event::BusinessSaved(settings)).await
    }

    pub async fn save_staff(&self, member: StaffMember) -> Result<(), RepoError> {
        check_name(&member.name)?;
        if !self.businesses.contains_key(&member.business_id) {
            return Err(RepoError::Invalid(format!("business {}", member.business_id)));
        }
        if let Some(existing) = self.staff.get(&member.id)
            && existing.business_id != member.business_id
        {
            return Err(RepoError::Invalid(format!(
                "staff {} belongs to another business",
                member.id
            )));
        }
        if !self.staff.contains_key(&member.id) {
            let headcount = self
                .staff
                .iter()
                .filter(|s| s.business_id == member.business_id)
                .count();
            if headcount >= MAX_STAFF_PER_BUSINESS {
                return Err(RepoError::LimitExceeded("too many staff members"));
            }
        }
        self.persist_catalog(Event::StaffSaved(member)).await
    }

    pub async fn save_service(&self, spec: ServiceSpec) -> Result<(), RepoError> {
        check_name(&spec.name)?;
        if !self.businesses.contains_key(&spec.business_id) {
            return Err(RepoError::Invalid(format!("business {}", spec.business_id)));
        }
        if spec.duration_minutes == 0 || spec.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(RepoError::Invalid(format!(
                "service duration {} minutes",
                spec.duration_minutes
            )));
        }
        self.persist_catalog(Event::ServiceSaved(spec)).await
    }

    pub async fn save_working_interval(&self, interval: WorkingInterval) -> Result<(), RepoError> {
        if !self.staff.contains_key(&interval.staff_id) {
            return Err(RepoError::Invalid(format!("staff {}", interval.staff_id)));
        }
        if interval.weekday > 6 {
            return Err(RepoError::Invalid(format!("weekday {}", interval.weekday)));
        }
        if interval.active && interval.start_time >= interval.end_time {
            return Err(RepoError::Invalid(format!(
                "working interval {}-{}: start must be before end",
                interval.start_time, interval.end_time
            )));
        }
        self.persist_catalog(Event::WorkingIntervalSaved(interval)).await
    }

    pub async fn grant_qualification(&self, staff_id: Ulid, service_id: Ulid) -> Result<(), RepoError> {
        let staff_business = self
            .staff
            .get(&staff_id)
            .map(|s| s.business_id)
            .ok_or_else(|| RepoError::Invalid(format!("staff {staff_id}")))?;
        let service_business = self
            .services
            .get(&service_id)
            .map(|s| s.business_id)
            .ok_or_else(|| RepoError::Invalid(format!("service {service_id}")))?;
        if staff_business != service_business {
            return Err(RepoError::Invalid(
                "staff member and service belong to different businesses".into(),
            ));
        }
        self.persist_catalog(Event::QualificationGranted {
            staff_id,
            service_id,
        })
        .await
    }

    pub async fn revoke_qualification(&self, staff_id: Ulid, service_id: Ulid) -> Result<(), RepoError> {
        self.persist_catalog(Event::QualificationRevoked {
            staff_id,
            service_id,
        })
        .await
    }
}

#[async_trait]
impl Catalog for Store {
    async fn business(&self, id: Ulid) -> Result<Option<BusinessSettings>, RepoError> {
        Ok(self.businesses.get(&id).map(|e| e.value().clone()))
    }

    async fn service(&self, id: Ulid) -> Result<Option<ServiceSpec>, RepoError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }

    async fn staff_member(&self, id: Ulid) -> Result<Option<StaffMember>, RepoError> {
        Ok(self.staff.get(&id).map(|e| e.value().clone()))
    }

    async fn working_interval(
        &self,
        staff_id: Ulid,
        weekday: u8,
    ) -> Result<Option<WorkingInterval>, RepoError> {
        Ok(self
            .schedules
            .get(&(staff_id, weekday))
            .map(|e| e.value().clone()))
    }

    async fn qualified_staff(&self, service_id: Ulid) -> Result<Vec<Ulid>, RepoError> {
        let mut staff: Vec<Ulid> = self
            .qualifications
            .get(&service_id)
            .map(|e| e.value().iter().copied().collect())
            .unwrap_or_default();
        staff.sort();
        Ok(staff)
    }

    async fn is_qualified(&self, staff_id: Ulid, service_id: Ulid) -> Result<bool, RepoError> {
        Ok(self
            .qualifications
            .get(&service_id)
            .is_some_and(|e| e.value().contains(&staff_id)))
    }
}
