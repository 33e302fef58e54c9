//! Queue worker integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use courier::config::QueueConfig;
use courier::handlers::{CommandHandler, EventHandler};
use courier::queue::{InMemoryQueue, MessageQueue, QueueWorker, QueuedMessage};
use courier::registry::Registration;
use courier::{DispatchError, Processor, Request, Task};

struct Deposit(u32);

struct Withdraw(u32);

struct Audit;

/// Sums deposits and rejects every withdrawal.
struct Ledger {
    balance: Arc<AtomicU32>,
}

impl CommandHandler for Ledger {
    type Command = Deposit;
    type Output = u32;

    fn handle(&self, command: &Deposit, _request: &Arc<Request>) -> Task<u32> {
        Task::from_result(self.balance.fetch_add(command.0, Ordering::SeqCst) + command.0)
    }
}

struct Teller;

impl CommandHandler for Teller {
    type Command = Withdraw;
    type Output = u32;

    fn handle(&self, _command: &Withdraw, _request: &Arc<Request>) -> Task<u32> {
        Task::from_error(DispatchError::InvalidOperation("insufficient funds".to_string()))
    }
}

struct Auditor {
    audits: Arc<AtomicU32>,
}

impl EventHandler for Auditor {
    type Event = Audit;

    fn handle(&self, _event: &Audit, _request: &Arc<Request>) -> Task<()> {
        self.audits.fetch_add(1, Ordering::SeqCst);
        Task::completed()
    }
}

fn processor(balance: &Arc<AtomicU32>, audits: &Arc<AtomicU32>) -> Arc<Processor> {
    let balance = balance.clone();
    let audits = audits.clone();
    Arc::new(
        Processor::builder()
            .register(Registration::command(move |_| {
                Ok(Ledger {
                    balance: balance.clone(),
                })
            }))
            .register(Registration::command(|_| Ok(Teller)))
            .register(Registration::event(move |_| {
                Ok(Auditor {
                    audits: audits.clone(),
                })
            }))
            .build(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_drains_queue_until_closed() {
    let balance = Arc::new(AtomicU32::new(0));
    let audits = Arc::new(AtomicU32::new(0));
    let config = QueueConfig {
        workers: 3,
        capacity: 16,
    };
    let queue = Arc::new(InMemoryQueue::from_config(&config));

    for amount in 1..=5 {
        queue
            .enqueue(QueuedMessage::command::<_, u32>(Deposit(amount)))
            .await
            .unwrap();
    }
    queue
        .enqueue(QueuedMessage::command::<_, u32>(Withdraw(100)))
        .await
        .unwrap();
    queue.enqueue(QueuedMessage::event(Audit)).await.unwrap();
    queue.close();

    QueueWorker::new(processor(&balance, &audits), queue.clone(), &config)
        .run()
        .await;

    assert_eq!(balance.load(Ordering::SeqCst), 15);
    assert_eq!(audits.load(Ordering::SeqCst), 1);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn closed_queue_rejects_messages() {
    let queue = InMemoryQueue::new(4);
    queue.close();

    let err = queue
        .enqueue(QueuedMessage::event(Audit))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Queue(_)));
}
