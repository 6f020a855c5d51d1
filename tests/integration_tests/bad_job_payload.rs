// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use bytes::Bytes;
use gearman_curler::gearman::{codec::Frame, constants::Command, session::Session, worker::Worker};
use serde_json::Value;

use crate::{
    integration_tests::common::curler_handler,
    support::fake_broker::{read_frame, spawn_fake_broker, write_frame},
};

async fn run_scenario(job_payload: &'static [u8]) -> Value {
    let (complete_tx, mut complete_rx) = tokio::sync::mpsc::unbounded_channel();

    let broker_addr = spawn_fake_broker(move |mut stream, _attempt| {
        let complete_tx = complete_tx.clone();
        async move {
            let can_do = read_frame(&mut stream).await.expect("read CAN_DO");
            assert_eq!(can_do.command, Command::CanDo);

            let grab = read_frame(&mut stream).await.expect("read GRAB_JOB");
            assert_eq!(grab.command, Command::GrabJob);

            let mut payload = Vec::from(&b"H1\0curler\0"[..]);
            payload.extend_from_slice(job_payload);
            write_frame(&mut stream, &Frame::new(Command::JobAssign, Bytes::from(payload))).await;

            let complete = read_frame(&mut stream).await.expect("read WORK_COMPLETE");
            assert_eq!(complete.command, Command::WorkComplete);
            let _ = complete_tx.send(complete.payload);
        }
    })
    .await;

    let session = Session::connect(broker_addr).await.expect("connect to fake broker");
    let worker = Worker::new(Arc::clone(&session)).await;
    worker
        .register_function("curler", curler_handler(vec!["http://127.0.0.1:1".to_string()]))
        .await
        .expect("register_function");

    let job = worker.get_job().await.expect("get_job ok").expect("job present");
    worker.finish_job(&job).await.expect("finish_job ok");

    let payload = complete_rx.recv().await.expect("WORK_COMPLETE observed");
    let (_handle, rest) = gearman_curler::gearman::codec::split_nul_once(&payload).expect("handle separator");
    serde_json::from_slice(&rest).expect("reply is valid json")
}

#[tokio::test]
async fn invalid_json_payload_reports_error() {
    let reply = run_scenario(b"not json").await;
    assert_eq!(reply["error"], "Job data is not valid JSON");
    assert_eq!(reply["job_data"], "not json");
    assert_eq!(reply["job_handle"], "H1");
}

#[tokio::test]
async fn missing_method_field_reports_error() {
    let reply = run_scenario(b"{\"data\":{}}").await;
    assert_eq!(reply["error"], "Missing \"method\" property in job data");
}
