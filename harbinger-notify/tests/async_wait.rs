//! Live registry scenarios: concurrent registration, wake delivery through
//! the worker pool, sweeper timeouts, and shutdown.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use harbinger_common::Signal;
use harbinger_notify::{
    AsyncWaiter, Dispatch, NotifyConfig, SessionHandle, SessionTable, WaitChannel, WaitReply,
    EC_REJECTED, EC_SUCCESS, FLAG_NOTIFICATION_PENDING,
};
use tokio::sync::{broadcast, oneshot};

struct OneUser;

impl SessionTable for OneUser {
    fn resolve(&self, _handle: &SessionHandle) -> Option<(String, u16)> {
        Some(("u".to_string(), 5))
    }
    fn has_pending(&self, _handle: &SessionHandle) -> bool {
        false
    }
}

const HANDLE: SessionHandle = SessionHandle([7; 16]);

fn waiter(waiting_interval: u64) -> Arc<AsyncWaiter> {
    AsyncWaiter::new(
        &NotifyConfig {
            threads_num: 2,
            context_num: 8,
            waiting_interval,
        },
        Arc::new(OneUser),
    )
}

fn rpc() -> (WaitChannel, oneshot::Receiver<WaitReply>) {
    let (tx, rx) = oneshot::channel();
    (WaitChannel::Rpc { reply: tx }, rx)
}

#[test]
fn concurrent_registrations_for_one_tag_admit_exactly_one() {
    let waiter = waiter(300);
    let mut handles = Vec::new();
    for async_id in 1..=2u32 {
        let waiter = Arc::clone(&waiter);
        handles.push(std::thread::spawn(move || {
            let (channel, _rx) = rpc();
            matches!(
                waiter.async_wait(async_id, &HANDLE, "u", channel),
                Dispatch::Pending
            )
        }));
    }
    let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(
        outcomes.iter().filter(|&&parked| parked).count(),
        1,
        "exactly one concurrent register may park"
    );
    assert_eq!(waiter.parked(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn wakeup_fires_the_parked_waiter_as_pending() {
    let waiter = waiter(300);
    let (shutdown, _keep) = broadcast::channel(1);
    let tasks = waiter.start(&shutdown);

    let (channel, rx) = rpc();
    assert!(matches!(
        waiter.async_wait(1, &HANDLE, "u", channel),
        Dispatch::Pending
    ));

    waiter.wakeup("u", 5);
    let reply = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("worker must fire within the latency budget")
        .unwrap();
    assert_eq!(reply.result, EC_SUCCESS);
    assert_eq!(reply.flags_out, FLAG_NOTIFICATION_PENDING);
    assert_eq!(waiter.parked(), 0);

    shutdown.send(Signal::Shutdown).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn wakeup_after_detachment_does_not_match_and_waiter_times_out() {
    // registration after a wakeup must wait for the next event (or expire)
    let waiter = waiter(3);
    let (shutdown, _keep) = broadcast::channel(1);
    let tasks = waiter.start(&shutdown);

    waiter.wakeup("u", 5); // nobody parked: no-op

    let (channel, rx) = rpc();
    assert!(matches!(
        waiter.async_wait(1, &HANDLE, "u", channel),
        Dispatch::Pending
    ));

    // waiting_interval 3 leaves a zero cutoff, so the next sweeps collect it
    let reply = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("sweeper must answer an expired waiter")
        .unwrap();
    assert_eq!(reply.result, EC_SUCCESS);
    assert_eq!(reply.flags_out, 0, "timeout fires as not-pending");
    assert_eq!(waiter.parked(), 0);

    shutdown.send(Signal::Shutdown).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn http_waiters_fire_through_the_registered_activator() {
    let waiter = waiter(300);
    let (shutdown, _keep) = broadcast::channel(1);
    let tasks = waiter.start(&shutdown);

    let (fired_tx, fired_rx) = mpsc::channel();
    waiter.register_http_activator(move |context_id, pending| {
        fired_tx.send((context_id, pending)).unwrap();
    });

    assert!(matches!(
        waiter.async_wait(0, &HANDLE, "u", WaitChannel::Http { context_id: 42 }),
        Dispatch::Pending
    ));
    waiter.wakeup("u", 5);

    let (context_id, pending) = fired_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(context_id, 42);
    assert!(pending);

    shutdown.send(Signal::Shutdown).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_waits_leave_no_residue() {
    let waiter = waiter(300);
    let (c1, _r1) = rpc();
    assert!(matches!(
        waiter.async_wait(1, &HANDLE, "u", c1),
        Dispatch::Pending
    ));
    let (c2, r2) = rpc();
    let Dispatch::Immediate(reply) = waiter.async_wait(2, &HANDLE, "u", c2) else {
        panic!("duplicate tag must reject");
    };
    assert_eq!(reply.result, EC_REJECTED);
    // the rejected channel is dropped unused; its receiver just errors
    assert!(r2.await.is_err());
    assert_eq!(waiter.parked(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_sweeper_and_workers() {
    let waiter = waiter(300);
    let (shutdown, _keep) = broadcast::channel(1);
    let tasks = waiter.start(&shutdown);

    shutdown.send(Signal::Shutdown).unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("tasks must exit promptly on shutdown")
            .unwrap();
    }
}
