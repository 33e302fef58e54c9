//! End-to-end scenarios through the public API.
//!
//! Covers the task combinators as a caller sees them, scheduling affinity
//! under a pumped context, and dispatch through a configured processor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use courier::handlers::CommandHandler;
use courier::pipeline::{ExecutedContext, ExecutingContext, Filter, HandlerFilter};
use courier::registry::Registration;
use courier::scheduling::{self, PumpContext, SchedulingContext};
use courier::task::{iterate, CancellationToken, ContinuationOptions, Fault, TaskCompletionSource};
use courier::{DispatchError, Processor, Request, Task};

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

// ============================================================================
// Task scenarios
// ============================================================================

#[test]
fn then_on_completed_task_runs_inline_without_posting() {
    let pump = PumpContext::new();
    let _guard = scheduling::enter(pump.clone() as Arc<dyn SchedulingContext>);

    let result = Task::completed().then(|()| Ok(42));

    assert_eq!(result.try_get_result(), Some(42));
    assert_eq!(pump.post_count(), 0);
}

#[test]
fn catch_recovers_a_fault_with_a_value() {
    let failed: Task<i32> =
        Task::from_error(DispatchError::InvalidOperation("boom".to_string()));

    let recovered = failed.catch(|info| info.handled(42));

    assert_eq!(recovered.wait().unwrap(), 42);
}

#[test]
fn iterate_stops_at_a_canceled_task() {
    let log = Log::default();
    let producer_log = log.clone();
    let steps = (1..=3).map(move |step| {
        producer_log.lock().push(format!("enter {step}"));
        match step {
            2 => Task::<()>::canceled(),
            _ => Task::completed(),
        }
    });

    let result = iterate(steps, None);

    assert!(result.is_canceled());
    assert_eq!(entries(&log), vec!["enter 1", "enter 2"]);
}

#[test]
fn fault_skips_then_continuation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let failed: Task<u32> = Task::from_error(DispatchError::InvalidOperation("x".to_string()));

    let chained = failed.then(move |v| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(v + 1)
    });

    let err = chained.wait().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DispatchError>(),
        Some(DispatchError::InvalidOperation(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn canceled_token_skips_then_continuation() {
    let options = ContinuationOptions::new().with_cancellation(CancellationToken::canceled());

    let chained = Task::from_result(1u32).then_with(options, |v| Ok(v + 1));

    assert!(chained.is_canceled());
}

#[test]
fn catch_leaves_success_and_cancellation_untouched() {
    let ok = Task::from_result(5u32).catch(|info| info.handled(0));
    let canceled = Task::<u32>::canceled().catch(|info| info.handled(0));

    assert_eq!(ok.try_get_result(), Some(5));
    assert!(canceled.is_canceled());
}

#[test]
fn finally_runs_once_for_every_terminal_state() {
    let runs = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task<u32>> = vec![
        Task::from_result(1),
        Task::from_error(DispatchError::InvalidOperation("x".to_string())),
        Task::canceled(),
    ];

    for task in tasks {
        let counter = runs.clone();
        let _ = task.finally(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn pending_continuation_is_posted_once_to_captured_context() {
    let pump = PumpContext::new();
    let _guard = scheduling::enter(pump.clone() as Arc<dyn SchedulingContext>);
    let source = TaskCompletionSource::<u32>::new();
    let pump_thread = thread::current().id();

    let observed = source.task().map(move |v| (v, thread::current().id() == pump_thread));

    let producer = source.clone();
    thread::spawn(move || {
        producer.try_set_result(7);
    })
    .join()
    .unwrap();
    pump.run_until(&observed);

    assert_eq!(observed.try_get_result(), Some((7, true)));
    assert_eq!(pump.post_count(), 1);
}

// ============================================================================
// Dispatch scenarios
// ============================================================================

struct Reserve {
    seats: u32,
}

struct Reservations;

impl CommandHandler for Reservations {
    type Command = Reserve;
    type Output = u32;

    fn handle(&self, command: &Reserve, _request: &Arc<Request>) -> Task<u32> {
        Task::from_result(command.seats)
    }
}

struct Logging {
    name: &'static str,
    log: Log,
    short_circuit: Option<u32>,
}

impl HandlerFilter for Logging {
    fn on_executing(&self, context: &mut ExecutingContext) -> Result<(), Fault> {
        self.log.lock().push(format!("{}.pre", self.name));
        if let Some(value) = self.short_circuit {
            context.set_result(value);
        }
        Ok(())
    }

    fn on_executed(&self, context: &mut ExecutedContext) -> Result<(), Fault> {
        let result = context.result_as::<u32>().copied();
        self.log
            .lock()
            .push(format!("{}.post {:?}", self.name, result));
        Ok(())
    }
}

struct Cancel;

#[test]
fn dispatch_without_handler_fails_before_filters() {
    let log = Log::default();
    let processor = Processor::builder()
        .register(Registration::command(|_| Ok(Reservations)))
        .global_filter(Filter::handler(Logging {
            name: "global",
            log: log.clone(),
            short_circuit: None,
        }))
        .build();

    let err = processor.process::<_, ()>(Cancel).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<DispatchError>(),
        Some(DispatchError::HandlerNotFound { .. })
    ));
    assert!(entries(&log).is_empty());
}

struct Audited {
    log: Log,
}

impl CommandHandler for Audited {
    type Command = Reserve;
    type Output = u32;

    fn handle(&self, command: &Reserve, _request: &Arc<Request>) -> Task<u32> {
        self.log.lock().push("handle".to_string());
        Task::from_result(command.seats)
    }
}

#[test]
fn global_short_circuit_bypasses_handler_filters_and_handler() {
    let log = Log::default();
    let handler_log = log.clone();
    let processor = Processor::builder()
        .register(
            Registration::command(move |_| {
                Ok(Audited {
                    log: handler_log.clone(),
                })
            })
            .handler_filter(Logging {
                name: "handler",
                log: log.clone(),
                short_circuit: None,
            }),
        )
        .global_filter(Filter::handler(Logging {
            name: "global",
            log: log.clone(),
            short_circuit: Some(99),
        }))
        .build();

    let seats: u32 = processor.process(Reserve { seats: 2 }).unwrap();

    assert_eq!(seats, 99);
    assert_eq!(entries(&log), vec!["global.pre", "global.post Some(99)"]);
}

#[tokio::test]
async fn processor_result_can_be_awaited() {
    let processor = Processor::builder()
        .register(Registration::command(|_| Ok(Reservations)))
        .build();

    let seats = processor
        .process_async::<_, u32>(Reserve { seats: 4 })
        .await
        .unwrap();

    assert_eq!(seats, 4);
}
