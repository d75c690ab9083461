// 🔄 Sync Service - one reconciliation pass per entity kind
//
// local list -> remote list -> reconcile -> re-list -> mirror -> audit.
// Reading either side is fatal; everything after the engine runs is not.

use crate::catalog::{EntityCatalog, EntityDescriptor};
use crate::db::{self, AuditEntry};
use crate::error::SyncError;
use crate::local::LocalCatalogProvider;
use crate::reconciliation::{ActionReport, ReconciliationEngine};
use crate::remote::{tenant_filter, RemoteCatalogClient};
use crate::identity::RemoteRecord;
use rusqlite::Connection;
use tracing::{info, warn};

pub struct SyncService<'a> {
    conn: &'a Connection,
    catalog: &'a EntityCatalog,
    local: &'a dyn LocalCatalogProvider,
    client: &'a dyn RemoteCatalogClient,
    engine: ReconciliationEngine,
}

impl<'a> SyncService<'a> {
    pub fn new(
        conn: &'a Connection,
        catalog: &'a EntityCatalog,
        local: &'a dyn LocalCatalogProvider,
        client: &'a dyn RemoteCatalogClient,
        tenant: &str,
    ) -> Self {
        SyncService {
            conn,
            catalog,
            local,
            client,
            engine: ReconciliationEngine::new(tenant),
        }
    }

    fn list_remote(&self, descriptor: &EntityDescriptor) -> Result<Vec<RemoteRecord>, SyncError> {
        let filter = descriptor
            .tenant_scoped
            .then(|| tenant_filter(&self.engine.tenant));
        self.client
            .list(&descriptor.name, filter.as_deref())
            .map_err(|e| SyncError::source_read(&descriptor.name, e))
    }

    /// Reconcile one entity kind by name
    pub fn sync_entity(&self, name: &str) -> Result<ActionReport, SyncError> {
        let descriptor = self
            .catalog
            .get(name)
            .ok_or_else(|| SyncError::UnknownEntity(name.to_string()))?;
        self.sync_descriptor(descriptor)
    }

    pub fn sync_descriptor(&self, descriptor: &EntityDescriptor) -> Result<ActionReport, SyncError> {
        let local = self.local.list(descriptor)?;
        let remote = self.list_remote(descriptor)?;
        info!(
            entity = %descriptor.name,
            local = local.len(),
            remote = remote.len(),
            "reconciling"
        );

        let report = self.engine.reconcile(self.client, descriptor, &local, &remote);
        info!("{}", report);

        self.refresh_mirror(descriptor);

        let audit = AuditEntry::reconciled(
            &descriptor.name,
            &report.run_id,
            serde_json::json!({
                "counts": report.counts(),
                "skipped": report.skipped.len(),
            }),
        );
        if let Err(e) = db::record_audit(self.conn, &audit) {
            warn!(entity = %descriptor.name, error = %e, "failed to record audit event");
        }

        Ok(report)
    }

    /// Re-list after mutations and replace the mirror; failures only warn
    fn refresh_mirror(&self, descriptor: &EntityDescriptor) {
        let rows = match self.list_remote(descriptor) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(entity = %descriptor.name, error = %e, "mirror refresh skipped");
                return;
            }
        };
        match db::replace_mirror(self.conn, &descriptor.name, &rows) {
            Ok(count) => info!(entity = %descriptor.name, rows = count, "mirror refreshed"),
            Err(e) => warn!(entity = %descriptor.name, error = %e, "mirror refresh failed"),
        }
    }

    /// Every reconcilable kind in catalog order; the first fatal error stops the run
    pub fn sync_all(&self) -> Result<Vec<ActionReport>, SyncError> {
        let mut reports = Vec::new();
        for descriptor in self.catalog.reconcilable() {
            reports.push(self.sync_descriptor(descriptor)?);
        }
        info!(entities = reports.len(), "full sync complete");
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DESCRIPTION_FIELD, TENANT_FIELD};
    use crate::db::AuditSubject;
    use crate::local::{LocalRecord, StaticLocalCatalog};
    use crate::reconciliation::ReconciliationAction;
    use crate::remote::InMemoryRemoteCatalog;

    const GROUPS: &str = "IncidentGroupATISAs";

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_sync_entity_creates_and_mirrors() {
        let conn = setup();
        let catalog = EntityCatalog::builtin();
        let local = StaticLocalCatalog::new()
            .with_rows(GROUPS, vec![LocalRecord::new("I1", "Sick leave")]);
        let remote = InMemoryRemoteCatalog::new();
        let service = SyncService::new(&conn, &catalog, &local, &remote, "itb");

        let report = service.sync_entity(GROUPS).unwrap();
        assert_eq!(report.actions_for("I1"), vec![&ReconciliationAction::Created]);

        let mirror = db::load_mirror(&conn, GROUPS).unwrap();
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror[0][DESCRIPTION_FIELD], "Sick leave");
        assert_eq!(mirror[0][TENANT_FIELD], "itb");

        let trail = db::audit_trail(&conn, &AuditSubject::Entity(GROUPS.to_string())).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].run_id.as_deref(), Some(report.run_id.as_str()));
        assert_eq!(trail[0].detail["counts"]["created"], 1);

        // Second pass converges
        assert!(service.sync_entity(GROUPS).unwrap().is_converged());
    }

    #[test]
    fn test_source_failures_are_fatal() {
        let conn = setup();
        let catalog = EntityCatalog::builtin();
        let local = StaticLocalCatalog::new();
        let remote = InMemoryRemoteCatalog::new();
        let service = SyncService::new(&conn, &catalog, &local, &remote, "itb");

        assert!(service.sync_entity(GROUPS).unwrap_err().is_fatal());
        assert!(matches!(
            service.sync_entity("Nope").unwrap_err(),
            SyncError::UnknownEntity(_)
        ));

        let local = StaticLocalCatalog::new().with_rows(GROUPS, vec![]);
        remote.fail_next("list", crate::error::RemoteError::from_response(503, String::new()));
        let service = SyncService::new(&conn, &catalog, &local, &remote, "itb");
        assert!(matches!(
            service.sync_entity(GROUPS).unwrap_err(),
            SyncError::SourceReadFailure { .. }
        ));
        assert!(remote.calls().iter().all(|c| !c.starts_with("create")));
    }
}
