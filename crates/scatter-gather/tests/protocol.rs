//! Exercises the testable properties and seed scenarios of the
//! scatter-gather coordination protocol, against the in-memory reference
//! adapter.

use scatter_gather::backends::memory::MemoryPersistence;
use scatter_gather::{Error, Gateway, PartId, RequestId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn rid(s: &str) -> RequestId {
    RequestId::new(s)
}

fn pids(ids: &[&str]) -> Vec<PartId> {
    ids.iter().map(|s| PartId::new(*s)).collect()
}

fn gateway() -> Gateway<MemoryPersistence> {
    Gateway::new(MemoryPersistence::new())
}

/// A handler that records every context it was called with, so tests can
/// assert both the call count and the exact value received.
#[derive(Clone, Default)]
struct Recorder(Arc<std::sync::Mutex<Vec<String>>>);

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn handler(&self) -> impl FnOnce(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send>> + Send {
        let recorder = self.clone();
        move |context: String| {
            Box::pin(async move {
                recorder.0.lock().unwrap().push(context);
                Ok(())
            })
        }
    }
}

#[tokio::test]
async fn nothing_to_scatter() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();

    let h = Recorder::default();
    gw.end_scatter(&rid("r"), h.handler()).await.unwrap();

    assert_eq!(h.calls(), vec!["ctx"]);
}

#[tokio::test]
async fn simple_scatter_gather() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["lorem", "ipsum"]), || async {})
        .await
        .unwrap();

    let h = Recorder::default();
    gw.end_scatter(&rid("r"), h.handler()).await.unwrap();
    assert!(h.calls().is_empty(), "parts still outstanding");

    let h2 = Recorder::default();
    gw.gather(&rid("r"), pids(&["ipsum"]), h2.handler())
        .await
        .unwrap();
    assert!(h2.calls().is_empty(), "one part remains");

    let h3 = Recorder::default();
    gw.gather(&rid("r"), pids(&["lorem"]), h3.handler())
        .await
        .unwrap();
    assert_eq!(h3.calls(), vec!["ctx"]);
}

#[tokio::test]
async fn gather_precedes_end_scatter() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["lorem"]), || async {})
        .await
        .unwrap();

    let h = Recorder::default();
    gw.gather(&rid("r"), pids(&["lorem"]), h.handler())
        .await
        .unwrap();
    assert!(h.calls().is_empty());

    let h2 = Recorder::default();
    gw.end_scatter(&rid("r"), h2.handler()).await.unwrap();
    assert_eq!(h2.calls(), vec!["ctx"]);
}

#[tokio::test]
async fn duplicate_gather_before_completion_fires_handler_once() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["lorem", "ipsum"]), || async {})
        .await
        .unwrap();
    gw.end_scatter(&rid("r"), Recorder::default().handler())
        .await
        .unwrap();

    let recorder = Recorder::default();

    gw.gather(&rid("r"), pids(&["ipsum"]), recorder.handler())
        .await
        .unwrap();
    // Second gather of an already-absent part is a no-op.
    gw.gather(&rid("r"), pids(&["ipsum"]), recorder.handler())
        .await
        .unwrap();
    gw.gather(&rid("r"), pids(&["lorem"]), recorder.handler())
        .await
        .unwrap();

    assert_eq!(recorder.calls(), vec!["ctx"]);
}

#[tokio::test]
async fn duplicate_gather_after_completion_does_not_refire() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["lorem"]), || async {})
        .await
        .unwrap();
    gw.end_scatter(&rid("r"), Recorder::default().handler())
        .await
        .unwrap();

    let recorder = Recorder::default();
    gw.gather(&rid("r"), pids(&["lorem"]), recorder.handler())
        .await
        .unwrap();
    assert_eq!(recorder.calls(), vec!["ctx"]);

    // The Request row is gone; a stray late gather finds nothing to claim.
    let recorder2 = Recorder::default();
    gw.gather(&rid("r"), pids(&["lorem"]), recorder2.handler())
        .await
        .unwrap();
    assert!(recorder2.calls().is_empty());
}

#[tokio::test]
async fn handler_throws_then_retry_succeeds() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["lorem"]), || async {})
        .await
        .unwrap();
    gw.end_scatter(&rid("r"), Recorder::default().handler())
        .await
        .unwrap();

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    let first = gw
        .gather(&rid("r"), pids(&["lorem"]), |_ctx| async move {
            Err::<(), Error>(Error::handler(Boom))
        })
        .await;
    assert!(first.is_err());

    // The Request row is still present with locker_id = "Gather-lorem";
    // a retry from the same call site (same first part id) re-enters the
    // critical section.
    let recorder = Recorder::default();
    gw.gather(&rid("r"), pids(&["lorem"]), recorder.handler())
        .await
        .unwrap();
    assert_eq!(recorder.calls(), vec!["ctx"]);
}

#[tokio::test]
async fn re_scatter_resets_the_epoch() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx-1").await.unwrap();
    gw.scatter(&rid("r"), pids(&["old-a", "old-b"]), || async {})
        .await
        .unwrap();

    // Partially gather the first epoch, then discard it with a second
    // BeginScatter before it fully completes.
    gw.gather(&rid("r"), pids(&["old-a"]), Recorder::default().handler())
        .await
        .unwrap();

    gw.begin_scatter(&rid("r"), "ctx-2").await.unwrap();
    gw.scatter(&rid("r"), pids(&["new-a"]), || async {})
        .await
        .unwrap();

    // The straggler from the old epoch cannot trigger completion.
    let stray = Recorder::default();
    gw.gather(&rid("r"), pids(&["old-b"]), stray.handler())
        .await
        .unwrap();
    assert!(stray.calls().is_empty());

    gw.end_scatter(&rid("r"), Recorder::default().handler())
        .await
        .unwrap();

    let recorder = Recorder::default();
    gw.gather(&rid("r"), pids(&["new-a"]), recorder.handler())
        .await
        .unwrap();
    assert_eq!(recorder.calls(), vec!["ctx-2"]);
}

#[tokio::test]
async fn concurrent_last_two_parts_gather_fires_handler_exactly_once() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["a", "b"]), || async {})
        .await
        .unwrap();
    gw.end_scatter(&rid("r"), Recorder::default().handler())
        .await
        .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let (c1, c2) = (count.clone(), count.clone());

    let (r1, r2) = tokio::join!(
        gw.gather(&rid("r"), pids(&["a"]), move |_ctx| async move {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        gw.gather(&rid("r"), pids(&["b"]), move |_ctx| async move {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn end_scatter_races_final_gather_exactly_once() {
    init_tracing();
    let gw = gateway();
    gw.begin_scatter(&rid("r"), "ctx").await.unwrap();
    gw.scatter(&rid("r"), pids(&["only"]), || async {})
        .await
        .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let (c1, c2) = (count.clone(), count.clone());

    let (r1, r2) = tokio::join!(
        gw.end_scatter(&rid("r"), move |_ctx| async move {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        gw.gather(&rid("r"), pids(&["only"]), move |_ctx| async move {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}
