use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::engine::Engine;
use crate::lifecycle;
use crate::limits::*;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// lifecycle sweeper + compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    /// `None` disables the lifecycle sweeper.
    lifecycle_interval: Option<Duration>,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        lifecycle_interval: Option<Duration>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lifecycle_interval,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two first connections for the same tenant race here; the entry API
        // makes sure only one engine (and one WAL writer) survives.
        let entry = self.engines.entry(tenant.to_string());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        if let Some(period) = self.lifecycle_interval {
            tokio::spawn(lifecycle::run_lifecycle(engine.clone(), period));
        }
        tokio::spawn(lifecycle::run_compactor(
            engine.clone(),
            self.compact_threshold,
        ));

        info!("loaded tenant {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("capledger_test_tenant")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, None)
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same engineer id in both tenants.
        let eid = Ulid::new();
        eng_a.create_engineer(eid, None, 100).await.unwrap();
        eng_b.create_engineer(eid, None, 100).await.unwrap();

        eng_a
            .create_assignment(NewAssignment {
                id: Ulid::new(),
                engineer_id: eid,
                project_id: Ulid::new(),
                span: Span::new(0, 10_000),
                allocation: 90,
                status: AssignmentStatus::Planned,
            })
            .await
            .unwrap();

        let check_b = eng_b.check_allocation(eid, 0, 10_000, 90, None).await.unwrap();
        assert!(check_b.fits);
        let check_a = eng_a.check_allocation(eid, 0, 10_000, 90, None).await.unwrap();
        assert!(!check_a.fits);
        assert_eq!(check_a.current, 90);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_survives_restart() {
        let dir = test_data_dir("restart");
        let eid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let engine = tm.get_or_create("acme").unwrap();
            engine
                .create_engineer(eid, Some("Grace".into()), 80)
                .await
                .unwrap();
        }

        let tm = manager(dir);
        let engine = tm.get_or_create("acme").unwrap();
        let info = engine.get_engineer_info(eid).await.unwrap();
        assert_eq!(info.name.as_deref(), Some("Grace"));
        assert_eq!(info.max_capacity, 80);
    }
}
