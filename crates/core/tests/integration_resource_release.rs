//! Integration tests for releasing argument payloads and stored values
//!
//! Releasable argument payloads are released exactly once when their argument
//! ends, whether it passed, failed or was skipped. Releasable store values are
//! released when their scope's store is cleared.

mod common;

use common::{is_success, Journal, RecordingSink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trellis_core::context::{ArgumentContext, ClassContext};
use trellis_core::descriptor::{Argument, ClassDefinition, NodeKind, PhaseStep};
use trellis_core::engine::Engine;
use trellis_core::interceptor::ClassInterceptor;
use trellis_core::store::Releasable;

/// Payload journaling its release
struct Connection {
    name: String,
    journal: Journal,
    fail_release: bool,
}

impl Connection {
    fn argument(name: &str, journal: &Journal) -> Argument {
        Argument::releasable(
            name,
            Connection {
                name: name.to_string(),
                journal: journal.clone(),
                fail_release: false,
            },
        )
    }
}

impl Releasable for Connection {
    fn release(&self) -> anyhow::Result<()> {
        self.journal.push(format!("release {}", self.name));
        anyhow::ensure!(!self.fail_release, "socket already closed");
        Ok(())
    }
}

fn logged(journal: &Journal, name: &'static str) -> PhaseStep<ArgumentContext> {
    let journal = journal.clone();
    PhaseStep::new(name, move |ctx: &ArgumentContext| {
        journal.push(format!("{} {}", name, ctx.argument()?.name()));
        Ok(())
    })
}

#[tokio::test]
async fn test_payload_released_after_after_all() {
    let journal = Journal::new();
    let class = ClassDefinition::new("Connections")
        .arguments([
            Connection::argument("db1", &journal),
            Connection::argument("db2", &journal),
        ])
        .test(logged(&journal, "test"))
        .after_all(logged(&journal, "after_all"));

    let report = Engine::builder()
        .build()
        .unwrap()
        .run(vec![class])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        journal.entries(),
        vec![
            "test db1",
            "after_all db1",
            "release db1",
            "test db2",
            "after_all db2",
            "release db2",
        ]
    );
    let argument = report.root.classes()[0].arguments()[0].argument();
    assert!(argument.is_releasable());
    assert!(argument.is_released());
}

#[tokio::test]
async fn test_payload_released_when_steps_fail() {
    let journal = Journal::new();
    let class = ClassDefinition::new("Failing")
        .argument(Connection::argument("db", &journal))
        .before_all(PhaseStep::new("fails", |_| anyhow::bail!("cannot connect")))
        .after_all(PhaseStep::new("also fails", |_| panic!("teardown bug")));

    let report = Engine::builder()
        .build()
        .unwrap()
        .run(vec![class])
        .await
        .unwrap();

    assert_eq!(report.summary.arguments.failed, 1);
    assert_eq!(journal.count("release db"), 1);
}

#[tokio::test]
async fn test_payload_released_when_class_setup_fails() {
    let journal = Journal::new();
    let class = ClassDefinition::new("Unprepared")
        .arguments([
            Connection::argument("a", &journal),
            Connection::argument("b", &journal),
        ])
        .prepare(PhaseStep::new("fails", |_: &ClassContext| anyhow::bail!("no")))
        .test(logged(&journal, "test"));

    Engine::builder()
        .build()
        .unwrap()
        .run(vec![class])
        .await
        .unwrap();

    assert_eq!(journal.entries(), vec!["release a", "release b"]);
}

#[tokio::test]
async fn test_release_failure_is_not_escalated() {
    let journal = Journal::new();
    let class = ClassDefinition::new("LeakyRelease")
        .argument(Argument::releasable(
            "flaky",
            Connection {
                name: "flaky".to_string(),
                journal: journal.clone(),
                fail_release: true,
            },
        ))
        .test(logged(&journal, "test"));

    let report = Engine::builder()
        .build()
        .unwrap()
        .run(vec![class])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(journal.count("release flaky"), 1);
}

#[tokio::test]
async fn test_store_values_released_with_their_scope() {
    struct Counted(Arc<AtomicUsize>);
    impl Releasable for Counted {
        fn release(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let argument_releases = Arc::new(AtomicUsize::new(0));
    let class_releases = Arc::new(AtomicUsize::new(0));
    let (a, c) = (argument_releases.clone(), class_releases.clone());
    let observed = Arc::new(AtomicUsize::new(usize::MAX));
    let o = observed.clone();
    let class_count = class_releases.clone();

    let class = ClassDefinition::new("Stores")
        .arguments((0..3).map(|i| Argument::of(i.to_string(), i)))
        .prepare(PhaseStep::new("pool", move |ctx: &ClassContext| {
            ctx.store().put_releasable("pool", Counted(c.clone()))?;
            Ok(())
        }))
        .before_all(PhaseStep::new("session", move |ctx: &ArgumentContext| {
            ctx.store().put_releasable("session", Counted(a.clone()))?;
            Ok(())
        }))
        .test(PhaseStep::new("uses", move |ctx: &ArgumentContext| {
            anyhow::ensure!(ctx.store().contains_key("session")?);
            o.store(class_count.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }));

    let report = Engine::builder()
        .build()
        .unwrap()
        .run(vec![class])
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.summary.failures);
    assert_eq!(argument_releases.load(Ordering::SeqCst), 3);
    assert_eq!(class_releases.load(Ordering::SeqCst), 1);
    // The class store was still intact while tests ran
    assert_eq!(observed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_store_release_keeps_teardown_and_events() {
    struct Exploding;
    impl Releasable for Exploding {
        fn release(&self) -> anyhow::Result<()> {
            panic!("close exploded");
        }
    }

    struct DestroyJournal(Journal);
    impl ClassInterceptor for DestroyJournal {
        fn name(&self) -> &str {
            "destroy-journal"
        }

        fn on_destroy(&self, ctx: &ClassContext) -> anyhow::Result<()> {
            self.0.push(format!("destroy {}", ctx.type_name()));
            Ok(())
        }
    }

    let journal = Journal::new();
    let sink = RecordingSink::new();
    let class = ClassDefinition::new("Exploding")
        .argument(Argument::of("a", ()))
        .prepare(PhaseStep::new("pool", |ctx: &ClassContext| {
            ctx.store().put_releasable("pool", Exploding)?;
            Ok(())
        }))
        .before_all(PhaseStep::new("session", |ctx: &ArgumentContext| {
            ctx.store().put_releasable("session", Exploding)?;
            Ok(())
        }))
        .test(logged(&journal, "test"));

    let report = Engine::builder()
        .class_interceptor(Arc::new(DestroyJournal(journal.clone())))
        .result_sink(sink.clone())
        .build()
        .unwrap()
        .run(vec![class])
        .await
        .unwrap();

    sink.assert_well_formed();
    assert!(report.is_success(), "{:?}", report.summary.failures);
    assert_eq!(journal.entries(), vec!["test a", "destroy Exploding"]);
    assert!(is_success(
        &sink.outcomes(NodeKind::Argument)["[engine:trellis]/[class:Exploding]/[argument:0]"]
    ));
    assert!(is_success(
        &sink.outcomes(NodeKind::Class)["[engine:trellis]/[class:Exploding]"]
    ));
}
