// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use bytes::Bytes;
use gearman_curler::gearman::{codec::Frame, constants::Command, session::Session, worker::Worker};

use crate::{
    integration_tests::common::curler_handler,
    support::fake_broker::{read_frame, spawn_fake_broker, write_frame},
};

/// The broker sends NO_JOB then NOOP then JOB_ASSIGN; the worker must
/// emit exactly GRAB_JOB, PRE_SLEEP, GRAB_JOB before receiving work.
#[tokio::test]
async fn no_job_then_noop_then_job_assign_sequence() {
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    let broker_addr = spawn_fake_broker(move |mut stream, _attempt| {
        let seen_tx = seen_tx.clone();
        async move {
            let can_do = read_frame(&mut stream).await.expect("read CAN_DO");
            assert_eq!(can_do.command, Command::CanDo);

            let grab1 = read_frame(&mut stream).await.expect("read first GRAB_JOB");
            let _ = seen_tx.send(grab1.command);
            write_frame(&mut stream, &Frame::new(Command::NoJob, Bytes::new())).await;

            let pre_sleep = read_frame(&mut stream).await.expect("read PRE_SLEEP");
            let _ = seen_tx.send(pre_sleep.command);
            write_frame(&mut stream, &Frame::new(Command::Noop, Bytes::new())).await;

            let grab2 = read_frame(&mut stream).await.expect("read second GRAB_JOB");
            let _ = seen_tx.send(grab2.command);

            let job_payload = Bytes::from_static(b"H1\0curler\0{\"method\":\"ping\",\"data\":{}}");
            write_frame(&mut stream, &Frame::new(Command::JobAssign, job_payload)).await;
        }
    })
    .await;

    let session = Session::connect(broker_addr).await.expect("connect to fake broker");
    let worker = Worker::new(Arc::clone(&session)).await;
    worker
        .register_function("curler", curler_handler(vec!["http://127.0.0.1:1".to_string()]))
        .await
        .expect("register_function");

    // First grab sees NO_JOB, so the worker should sleep and retry.
    assert!(worker.get_job().await.expect("first get_job ok").is_none());
    worker.sleep_until_noop().await.expect("sleep_until_noop ok");
    let job = worker.get_job().await.expect("second get_job ok").expect("job present");
    assert_eq!(job.function_name, "curler");

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(seen_rx.recv().await.expect("command observed"));
    }
    assert_eq!(seen, vec![Command::GrabJob, Command::PreSleep, Command::GrabJob]);
}
