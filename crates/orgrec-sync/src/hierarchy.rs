//! Transitive reporting closure over direct supervisor edges.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use orgrec_core::{ClosureEntry, EmployeeId, HierarchyError, SupervisorEdge};
use orgrec_storage::{ClosureSwap, RosterStore, StoreError};
use tracing::{error, info};

/// Computes every (report, ancestor, level) triple reachable through `edges`.
///
/// Each employee walks up its chain with its own path set, so a revisit means
/// the chain loops. Output is sorted by report then level.
pub fn rebuild_closure(edges: &[SupervisorEdge]) -> Result<Vec<ClosureEntry>, HierarchyError> {
    let mut parent = BTreeMap::new();
    for edge in edges {
        if edge.employee_id == edge.supervisor_id {
            return Err(HierarchyError::Cycle {
                members: vec![edge.employee_id, edge.employee_id],
            });
        }
        match parent.insert(edge.employee_id, edge.supervisor_id) {
            Some(previous) if previous != edge.supervisor_id => {
                return Err(HierarchyError::ConflictingSupervisor {
                    employee_id: edge.employee_id,
                    first: previous,
                    second: edge.supervisor_id,
                })
            }
            _ => {}
        }
    }

    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for &report in parent.keys() {
        let mut path = vec![report];
        let mut on_path = HashSet::from([report]);
        let mut current = report;
        let mut level = 0u32;
        while let Some(&supervisor) = parent.get(&current) {
            level += 1;
            if !on_path.insert(supervisor) {
                let start = path.iter().position(|id| *id == supervisor).unwrap_or(0);
                let mut members = path[start..].to_vec();
                members.push(supervisor);
                return Err(HierarchyError::Cycle { members });
            }
            if seen.insert((report, supervisor)) {
                entries.push(ClosureEntry {
                    report_id: report,
                    level,
                    supervisor_id: supervisor,
                });
            }
            path.push(supervisor);
            current = supervisor;
        }
    }
    entries.sort();
    Ok(entries)
}

/// Supervisors above `report_id`, nearest first.
pub fn ancestors_of(closure: &[ClosureEntry], report_id: EmployeeId) -> Vec<ClosureEntry> {
    let mut out = closure
        .iter()
        .filter(|e| e.report_id == report_id)
        .copied()
        .collect::<Vec<_>>();
    out.sort_by_key(|e| e.level);
    out
}

/// Everyone `supervisor_id` can see, direct reports first.
pub fn descendants_of(closure: &[ClosureEntry], supervisor_id: EmployeeId) -> Vec<ClosureEntry> {
    let mut out = closure
        .iter()
        .filter(|e| e.supervisor_id == supervisor_id)
        .copied()
        .collect::<Vec<_>>();
    out.sort_by_key(|e| (e.level, e.report_id));
    out
}

#[derive(Clone)]
pub struct HierarchyService {
    store: Arc<dyn RosterStore>,
}

impl HierarchyService {
    pub fn new(store: Arc<dyn RosterStore>) -> Self {
        Self { store }
    }

    /// Recomputes the closure under the store's exclusive rebuild; on an
    /// integrity error the stored closure is left as it was.
    pub async fn rebuild(&self) -> Result<ClosureSwap, StoreError> {
        match self.store.rebuild_closure(&rebuild_closure).await {
            Ok(swap) => {
                info!(
                    edges = swap.edges,
                    entries = swap.entries,
                    previous_entries = swap.previous_entries,
                    "hierarchy closure rebuilt"
                );
                Ok(swap)
            }
            Err(StoreError::Integrity(err)) => {
                error!(error = %err, "hierarchy rebuild aborted; previous closure kept");
                Err(StoreError::Integrity(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Sets or clears a direct supervisor. The store checks the resulting
    /// edge set and swaps the closure under one exclusive hold, so an
    /// assignment that would close a loop writes nothing, even when another
    /// assignment lands concurrently.
    pub async fn assign_supervisor(
        &self,
        employee_id: EmployeeId,
        supervisor_id: Option<EmployeeId>,
    ) -> Result<ClosureSwap, StoreError> {
        match self
            .store
            .set_supervisor(employee_id, supervisor_id, &rebuild_closure)
            .await
        {
            Ok(swap) => {
                info!(
                    employee = %employee_id,
                    supervisor = ?supervisor_id.map(|s| s.0),
                    entries = swap.entries,
                    "supervisor assigned"
                );
                Ok(swap)
            }
            Err(StoreError::Integrity(err)) => {
                error!(
                    employee = %employee_id,
                    error = %err,
                    "supervisor assignment rejected"
                );
                Err(StoreError::Integrity(err))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn ancestors(&self, report_id: EmployeeId) -> Result<Vec<ClosureEntry>, StoreError> {
        self.store.ancestors_of(report_id).await
    }

    pub async fn descendants(
        &self,
        supervisor_id: EmployeeId,
    ) -> Result<Vec<ClosureEntry>, StoreError> {
        let closure = self.store.load_closure().await?;
        Ok(descendants_of(&closure, supervisor_id))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use orgrec_core::{Employee, FieldUpdate};
    use orgrec_storage::{ClosureBuilder, RosterSnapshot, SnapshotStore};
    use tokio::sync::Barrier;

    use super::*;

    fn edge(employee: i64, supervisor: i64) -> SupervisorEdge {
        SupervisorEdge {
            employee_id: EmployeeId(employee),
            supervisor_id: EmployeeId(supervisor),
        }
    }

    fn entry(report: i64, level: u32, supervisor: i64) -> ClosureEntry {
        ClosureEntry {
            report_id: EmployeeId(report),
            level,
            supervisor_id: EmployeeId(supervisor),
        }
    }

    fn store(ids: &[i64], edges: Vec<SupervisorEdge>) -> Arc<SnapshotStore> {
        let employees = ids
            .iter()
            .map(|id| Employee {
                id: EmployeeId(*id),
                first_name: format!("E{id}"),
                last_name: "Staff".into(),
                department: String::new(),
                job_title: String::new(),
                contact: String::new(),
                active: true,
            })
            .collect();
        Arc::new(SnapshotStore::in_memory(RosterSnapshot {
            employees,
            edges,
            closure: Vec::new(),
        }))
    }

    #[test]
    fn chain_produces_levels_for_every_ancestor() {
        let closure = rebuild_closure(&[edge(2, 1), edge(3, 2), edge(4, 2)]).expect("closure");
        assert_eq!(
            closure,
            vec![
                entry(2, 1, 1),
                entry(3, 1, 2),
                entry(3, 2, 1),
                entry(4, 1, 2),
                entry(4, 2, 1),
            ]
        );
        assert!(closure.iter().all(|e| e.level >= 1));
        assert_eq!(
            ancestors_of(&closure, EmployeeId(3)),
            vec![entry(3, 1, 2), entry(3, 2, 1)]
        );
        assert_eq!(
            descendants_of(&closure, EmployeeId(1)),
            vec![entry(2, 1, 1), entry(3, 2, 1), entry(4, 2, 1)]
        );
        assert!(ancestors_of(&closure, EmployeeId(1)).is_empty());
    }

    #[test]
    fn rebuild_is_idempotent_and_ignores_repeated_edges() {
        let edges = [edge(2, 1), edge(3, 2), edge(2, 1)];
        let first = rebuild_closure(&edges).expect("first");
        let second = rebuild_closure(&edges).expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn empty_edge_set_has_empty_closure() {
        assert!(rebuild_closure(&[]).expect("closure").is_empty());
    }

    #[test]
    fn cycles_are_fatal_and_name_their_members() {
        let err = rebuild_closure(&[edge(1, 2), edge(2, 3), edge(3, 1), edge(4, 1)])
            .expect_err("cycle");
        assert_eq!(
            err,
            HierarchyError::Cycle {
                members: vec![EmployeeId(1), EmployeeId(2), EmployeeId(3), EmployeeId(1)],
            }
        );
        assert!(matches!(
            rebuild_closure(&[edge(5, 5)]),
            Err(HierarchyError::Cycle { .. })
        ));
    }

    #[test]
    fn conflicting_supervisors_are_rejected() {
        let err = rebuild_closure(&[edge(2, 1), edge(2, 3)]).expect_err("conflict");
        assert_eq!(
            err,
            HierarchyError::ConflictingSupervisor {
                employee_id: EmployeeId(2),
                first: EmployeeId(1),
                second: EmployeeId(3),
            }
        );
    }

    #[tokio::test]
    async fn service_rebuild_twice_yields_same_closure() {
        let store = store(&[1, 2, 3], vec![edge(2, 1), edge(3, 2)]);
        let service = HierarchyService::new(store.clone());
        let first = service.rebuild().await.expect("first");
        let closure_after_first = store.snapshot().await.closure;
        let second = service.rebuild().await.expect("second");
        assert_eq!(first.entries, 3);
        assert_eq!(second.previous_entries, 3);
        assert_eq!(store.snapshot().await.closure, closure_after_first);
    }

    #[tokio::test]
    async fn cycle_in_store_keeps_previous_closure() {
        let store = store(&[1, 2, 3], vec![edge(2, 1), edge(3, 2)]);
        let service = HierarchyService::new(store.clone());
        service.rebuild().await.expect("initial");
        let mut looping = store.snapshot().await;
        let before = looping.closure.clone();

        // A loop that reached storage some other way, e.g. an external import.
        looping.edges.push(edge(1, 3));
        let store = Arc::new(SnapshotStore::in_memory(looping));
        let service = HierarchyService::new(store.clone());
        let err = service.rebuild().await.expect_err("cycle");
        assert!(matches!(err, StoreError::Integrity(HierarchyError::Cycle { .. })));
        assert_eq!(store.snapshot().await.closure, before);
    }

    #[tokio::test]
    async fn assignment_creating_a_cycle_writes_nothing() {
        let store = store(&[1, 2, 3], vec![edge(2, 1), edge(3, 2)]);
        let service = HierarchyService::new(store.clone());
        service.rebuild().await.expect("initial");
        let before = store.snapshot().await;

        let err = service
            .assign_supervisor(EmployeeId(1), Some(EmployeeId(3)))
            .await
            .expect_err("cycle");
        assert!(matches!(err, StoreError::Integrity(_)));
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn assignment_moves_subtree_and_refreshes_visibility() {
        let store = store(&[1, 2, 3, 4], vec![edge(2, 1), edge(3, 2)]);
        let service = HierarchyService::new(store.clone());
        service.rebuild().await.expect("initial");

        service
            .assign_supervisor(EmployeeId(2), Some(EmployeeId(4)))
            .await
            .expect("assign");
        let ancestors = service.ancestors(EmployeeId(3)).await.expect("ancestors");
        assert_eq!(ancestors, vec![entry(3, 1, 2), entry(3, 2, 4)]);
        assert!(service.descendants(EmployeeId(1)).await.expect("descendants").is_empty());

        service
            .assign_supervisor(EmployeeId(2), None)
            .await
            .expect("detach");
        assert_eq!(
            service.ancestors(EmployeeId(3)).await.expect("ancestors"),
            vec![entry(3, 1, 2)]
        );
    }

    /// Holds every `set_supervisor` call until two are in flight.
    struct GatedStore {
        inner: Arc<SnapshotStore>,
        gate: Barrier,
    }

    #[async_trait]
    impl RosterStore for GatedStore {
        async fn load_roster(&self) -> Result<Vec<Employee>, StoreError> {
            self.inner.load_roster().await
        }

        async fn load_edges(&self) -> Result<Vec<SupervisorEdge>, StoreError> {
            self.inner.load_edges().await
        }

        async fn load_closure(&self) -> Result<Vec<ClosureEntry>, StoreError> {
            self.inner.load_closure().await
        }

        async fn ancestors_of(
            &self,
            report_id: EmployeeId,
        ) -> Result<Vec<ClosureEntry>, StoreError> {
            self.inner.ancestors_of(report_id).await
        }

        async fn rebuild_closure(
            &self,
            build: ClosureBuilder<'_>,
        ) -> Result<ClosureSwap, StoreError> {
            self.inner.rebuild_closure(build).await
        }

        async fn set_supervisor(
            &self,
            employee_id: EmployeeId,
            supervisor_id: Option<EmployeeId>,
            build: ClosureBuilder<'_>,
        ) -> Result<ClosureSwap, StoreError> {
            self.gate.wait().await;
            self.inner.set_supervisor(employee_id, supervisor_id, build).await
        }

        async fn apply_field_updates(&self, updates: &[FieldUpdate]) -> Result<usize, StoreError> {
            self.inner.apply_field_updates(updates).await
        }
    }

    #[tokio::test]
    async fn concurrent_assignments_cannot_close_a_loop() {
        let inner = store(&[1, 2, 3], Vec::new());
        let service = HierarchyService::new(Arc::new(GatedStore {
            inner: inner.clone(),
            gate: Barrier::new(2),
        }));

        let (first, second) = tokio::join!(
            service.assign_supervisor(EmployeeId(1), Some(EmployeeId(2))),
            service.assign_supervisor(EmployeeId(2), Some(EmployeeId(1))),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(StoreError::Integrity(HierarchyError::Cycle { .. }))
        )));

        let persisted = inner.snapshot().await;
        assert_eq!(persisted.edges.len(), 1);
        assert_eq!(
            rebuild_closure(&persisted.edges).expect("acyclic"),
            persisted.closure
        );
        service.rebuild().await.expect("rebuild after race");
    }
}
