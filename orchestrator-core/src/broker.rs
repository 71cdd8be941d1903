//! Stateless back-end selection: filter candidates by static fit, then rank
//! by live load, per §4.7.

use std::sync::Arc;

use futures::future::join_all;

use crate::backend::ExecutionBackend;
use crate::task::Requested;

/// Whether `attrs` can in principle satisfy `requested`, ignoring current
/// load.
fn statically_fits(backend: &dyn ExecutionBackend, requested: &Requested) -> bool {
    let attrs = backend.attributes();
    requested.cores <= attrs.max_cores_per_job
        && requested.memory_per_core_mib <= attrs.max_memory_per_core_mib
        && requested.wall_time_minutes <= attrs.max_wall_time_minutes
}

/// Filter `candidates` down to those that can satisfy `requested`, then
/// order the survivors best-first.
///
/// Each candidate's `get_resource_status` is refreshed first (in parallel);
/// a candidate whose refresh leaves `updated == false` is dropped unless
/// doing so would leave the result empty — a stale back-end is still worth
/// trying over no back-end at all.
///
/// Ranking key (ascending — first element wins): `(user_queued,
/// -free_slots, total_queued, user_running)`, preferring the back-end with
/// the fewest queued jobs of ours, then the most free capacity, then the
/// least total system queue, then the fewest jobs of ours already running.
pub async fn select<'a>(
    candidates: &'a [Arc<dyn ExecutionBackend>],
    requested: &Requested,
) -> Vec<&'a Arc<dyn ExecutionBackend>> {
    let fitting: Vec<&Arc<dyn ExecutionBackend>> = candidates
        .iter()
        .filter(|b| statically_fits(b.as_ref(), requested))
        .collect();

    join_all(fitting.iter().map(|b| b.get_resource_status())).await;

    let fresh: Vec<&Arc<dyn ExecutionBackend>> = fitting
        .iter()
        .filter(|b| b.resource_status().updated)
        .copied()
        .collect();

    let mut ranked = if fresh.is_empty() { fitting } else { fresh };

    ranked.sort_by_key(|b| {
        let s = b.resource_status();
        (s.user_queued, -s.free_slots, s.total_queued, s.user_run)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAttributes, ResourceStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    struct StubBackend {
        attrs: BackendAttributes,
        status: StdMutex<ResourceStatus>,
    }

    #[async_trait]
    impl ExecutionBackend for StubBackend {
        fn attributes(&self) -> &BackendAttributes {
            &self.attrs
        }
        fn resource_status(&self) -> ResourceStatus {
            *self.status.lock().unwrap()
        }
        async fn submit(&self, _task: &mut crate::task::Task) -> crate::error::OrchestratorResult<()> {
            Ok(())
        }
        async fn update_state(&self, _task: &mut crate::task::Task) -> crate::error::OrchestratorResult<()> {
            Ok(())
        }
        async fn cancel(&self, _task: &mut crate::task::Task) -> crate::error::OrchestratorResult<()> {
            Ok(())
        }
        async fn free(&self, _task: &mut crate::task::Task) {}
        async fn get_results(
            &self,
            _task: &crate::task::Task,
            _overwrite: bool,
            _changed_only: bool,
        ) -> crate::error::OrchestratorResult<()> {
            Ok(())
        }
        async fn peek(
            &self,
            _task: &crate::task::Task,
            _relative_path: &str,
            _offset: u64,
            _size: u64,
        ) -> crate::error::OrchestratorResult<Bytes> {
            Ok(Bytes::new())
        }
        async fn get_resource_status(&self) {}
        async fn close(&self) {}
    }

    fn attrs(name: &str) -> BackendAttributes {
        BackendAttributes {
            name: name.to_string(),
            architecture: "x86_64".to_string(),
            max_cores: 64,
            max_cores_per_job: 16,
            max_memory_per_core_mib: 4096,
            max_wall_time_minutes: 1440,
        }
    }

    fn requested() -> Requested {
        Requested {
            cores: 2,
            memory_per_core_mib: 1024,
            wall_time_minutes: 60,
        }
    }

    #[tokio::test]
    async fn drops_candidates_that_cannot_fit() {
        let mut small = attrs("small");
        small.max_cores_per_job = 1;
        let candidates: Vec<Arc<dyn ExecutionBackend>> = vec![Arc::new(StubBackend {
            attrs: small,
            status: StdMutex::new(ResourceStatus {
                updated: true,
                ..Default::default()
            }),
        })];
        let ranked = select(&candidates, &requested()).await;
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn ranks_by_least_loaded_first() {
        let busy = Arc::new(StubBackend {
            attrs: attrs("busy"),
            status: StdMutex::new(ResourceStatus {
                free_slots: 1,
                user_queued: 5,
                updated: true,
                ..Default::default()
            }),
        });
        let idle = Arc::new(StubBackend {
            attrs: attrs("idle"),
            status: StdMutex::new(ResourceStatus {
                free_slots: 10,
                user_queued: 0,
                updated: true,
                ..Default::default()
            }),
        });
        let candidates: Vec<Arc<dyn ExecutionBackend>> = vec![busy, idle];
        let ranked = select(&candidates, &requested()).await;
        assert_eq!(ranked[0].attributes().name, "idle");
    }
}
