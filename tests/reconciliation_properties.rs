// Reconciliation properties over the in-memory remote catalog:
// a second pass is a no-op, missing identities are created exactly once,
// duplicate remote identities converge to one row, and composite
// account/worksite pairs converge to exactly the local pairs.

use erp_sync::{
    EntityCatalog, InMemoryRemoteCatalog, LocalRecord, ReconciliationAction,
    ReconciliationEngine, RemoteCatalogClient, RemoteRecord,
};
use serde_json::json;
use std::collections::HashMap;

const ENTITY: &str = "HolidaysAbsencesGroupATISAs";
const KEY: &str = "EQMHolidaysAbsencesGroupATISAId";
const CCC_ENTITY: &str = "ContributionAccountCodeCCs";

fn remote_group(id: &str, description: &str) -> RemoteRecord {
    json!({ "dataAreaId": "itb", KEY: id, "Description": description })
        .as_object()
        .cloned()
        .unwrap()
}

fn scenarios() -> Vec<(Vec<LocalRecord>, Vec<RemoteRecord>)> {
    vec![
        // Empty remote
        (
            vec![LocalRecord::new("V1", "Standard"), LocalRecord::new("V2", "Summer")],
            vec![],
        ),
        // Drifted description, orphan, missing
        (
            vec![LocalRecord::new("V1", "Standard"), LocalRecord::new("V3", "Winter")],
            vec![remote_group("V1", "Old name"), remote_group("V9", "Orphan")],
        ),
        // Duplicates and an unresolvable row
        (
            vec![LocalRecord::new("V1", "Standard")],
            vec![
                remote_group("V1", "Standard"),
                remote_group("V1", "Copy"),
                json!({ "dataAreaId": "itb", "Description": "no key" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            ],
        ),
        // Empty local wipes the remote
        (vec![], vec![remote_group("V1", "Standard"), remote_group("V2", "Summer")]),
    ]
}

fn run(local: &[LocalRecord], seed: Vec<RemoteRecord>) -> (InMemoryRemoteCatalog, Vec<ReconciliationAction>) {
    let catalog = EntityCatalog::builtin();
    let descriptor = catalog.get(ENTITY).unwrap();
    let remote = InMemoryRemoteCatalog::new();
    remote.seed(ENTITY, seed);

    let engine = ReconciliationEngine::new("itb");
    let snapshot = remote.list(ENTITY, None).unwrap();
    let report = engine.reconcile(&remote, descriptor, local, &snapshot);
    let actions = report.entries.into_iter().map(|e| e.action).collect();
    (remote, actions)
}

fn keyed_rows(remote: &InMemoryRemoteCatalog) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for row in remote.rows(ENTITY) {
        if let Some(id) = row.get(KEY).and_then(|v| v.as_str()) {
            *counts.entry(id.trim().to_string()).or_insert(0) += 1;
        }
    }
    counts
}

#[test]
fn second_pass_is_a_no_op() {
    let catalog = EntityCatalog::builtin();
    let descriptor = catalog.get(ENTITY).unwrap();
    let engine = ReconciliationEngine::new("itb");

    for (local, seed) in scenarios() {
        let (remote, _) = run(&local, seed);
        remote.clear_calls();

        let snapshot = remote.list(ENTITY, None).unwrap();
        let report = engine.reconcile(&remote, descriptor, &local, &snapshot);

        assert!(report.is_converged(), "not converged: {}", report);
        assert!(remote.calls().is_empty(), "unexpected calls {:?}", remote.calls());
    }
}

#[test]
fn missing_identities_are_created_once() {
    for (local, seed) in scenarios() {
        let seeded: Vec<String> = seed
            .iter()
            .filter_map(|r| r.get(KEY).and_then(|v| v.as_str()).map(str::to_string))
            .collect();
        let (remote, _) = run(&local, seed);
        let rows = keyed_rows(&remote);

        for record in &local {
            if seeded.contains(&record.id) {
                continue;
            }
            assert_eq!(rows.get(&record.id), Some(&1), "{} not created exactly once", record.id);
        }
    }
}

#[test]
fn remote_converges_to_local() {
    for (local, seed) in scenarios() {
        let (remote, _) = run(&local, seed);
        let rows = keyed_rows(&remote);

        assert_eq!(rows.len(), local.len());
        for record in &local {
            assert_eq!(rows.get(&record.id), Some(&1));
        }
        for row in remote.rows(ENTITY) {
            let id = row.get(KEY).and_then(|v| v.as_str());
            let Some(id) = id else { continue };
            let expected = local.iter().find(|l| l.id == id).unwrap();
            assert_eq!(row["Description"], expected.display_value.as_str());
        }
    }
}

#[test]
fn duplicate_identities_keep_the_first_row() {
    let local = vec![LocalRecord::new("V1", "Standard")];
    let (remote, actions) = run(
        &local,
        vec![remote_group("V1", "Standard"), remote_group("V1", "Copy")],
    );

    assert_eq!(
        actions,
        vec![ReconciliationAction::Unchanged, ReconciliationAction::DuplicateRemoved]
    );
    let rows = remote.rows(ENTITY);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Description"], "Standard");
}

fn ccc(account: &str, place: &str) -> RemoteRecord {
    json!({ "EQMCCC": account, "EQMWorkerPlaceID": place })
        .as_object()
        .cloned()
        .unwrap()
}

fn ccc_pairs(remote: &InMemoryRemoteCatalog) -> Vec<String> {
    let mut pairs: Vec<String> = remote
        .rows(CCC_ENTITY)
        .iter()
        .filter_map(|row| {
            let account = row.get("EQMCCC")?.as_str()?;
            let place = row.get("EQMWorkerPlaceID")?.as_str()?;
            Some(format!("{}_{}", account.trim(), place.trim()))
        })
        .collect();
    pairs.sort();
    pairs
}

#[test]
fn composite_pairs_converge_to_local() {
    let catalog = EntityCatalog::builtin();
    let descriptor = catalog.get(CCC_ENTITY).unwrap();
    let engine = ReconciliationEngine::new("itb");

    let local = vec![
        LocalRecord::new("28111111111_004201", "CCC"),
        LocalRecord::new("28111111111_004202", "CCC"),
        LocalRecord::new("28222222222_004201", "CCC"),
    ];
    let remote = InMemoryRemoteCatalog::new();
    remote.seed(
        CCC_ENTITY,
        vec![
            ccc("28111111111", "004201"),
            ccc("28111111111", "004299"),
            ccc("28111111111", "004300"),
            ccc("28333333333", "004201"),
        ],
    );

    let snapshot = remote.list(CCC_ENTITY, None).unwrap();
    engine.reconcile(&remote, descriptor, &local, &snapshot);

    let mut expected: Vec<String> = local.iter().map(|l| l.id.clone()).collect();
    expected.sort();
    assert_eq!(ccc_pairs(&remote), expected);

    remote.clear_calls();
    let snapshot = remote.list(CCC_ENTITY, None).unwrap();
    let report = engine.reconcile(&remote, descriptor, &local, &snapshot);

    assert!(report.is_converged(), "not converged: {}", report);
    assert!(remote.calls().is_empty(), "unexpected calls {:?}", remote.calls());
}
