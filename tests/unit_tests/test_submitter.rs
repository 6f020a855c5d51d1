// SPDX-License-Identifier: AGPL-3.0-or-later

use bytes::{BufMut, Bytes, BytesMut};
use gearman_curler::gearman::{
    codec::{Frame, FrameDecoder},
    constants::{Command, RES_MAGIC},
    session::Session,
    submitter::{SubmitMode, Submitter},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex, split};

fn encode_res(frame: &Frame) -> Bytes {
    let mut bytes = BytesMut::with_capacity(12 + frame.payload.len());
    bytes.put_slice(&RES_MAGIC);
    bytes.put_u32(frame.command.into());
    bytes.put_u32(frame.payload.len() as u32);
    bytes.put_slice(&frame.payload);
    bytes.freeze()
}

#[tokio::test]
async fn foreground_submit_resolves_on_work_complete() {
    let (client, server) = duplex(8192);
    let (client_rd, client_wr) = split(client);
    let session = Session::spawn(None, client_rd, client_wr);
    let submitter = Submitter::new(session).await;

    let (mut server_rd, mut server_wr) = split(server);

    let server_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::for_requests();
        let mut buf = [0u8; 4096];
        let frame = loop {
            if let Some(f) = decoder.decode_next().expect("decode") {
                break f;
            }
            let n = server_rd.read(&mut buf).await.expect("read");
            decoder.feed(&buf[..n]);
        };
        assert_eq!(frame.command, Command::SubmitJob);

        let created = Frame::new(Command::JobCreated, Bytes::from_static(b"H1"));
        server_wr.write_all(&encode_res(&created)).await.expect("write job created");
        server_wr.flush().await.expect("flush");

        let complete = Frame::new(Command::WorkComplete, Bytes::from_static(b"H1\0done"));
        server_wr.write_all(&encode_res(&complete)).await.expect("write complete");
        server_wr.flush().await.expect("flush");
    });

    let (handle, outcome) = submitter
        .submit("reverse", "uniq", b"hello", SubmitMode::Normal)
        .await
        .expect("submit resolves");
    assert_eq!(handle, Bytes::from_static(b"H1"));
    assert_eq!(outcome.expect("outcome present").completion.as_ref(), b"done");

    server_task.await.expect("server task");
}

#[tokio::test]
async fn streamed_work_data_survives_into_the_completed_outcome() {
    let (client, server) = duplex(8192);
    let (client_rd, client_wr) = split(client);
    let session = Session::spawn(None, client_rd, client_wr);
    let submitter = Submitter::new(session).await;

    let (mut server_rd, mut server_wr) = split(server);

    let server_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::for_requests();
        let mut buf = [0u8; 4096];
        let frame = loop {
            if let Some(f) = decoder.decode_next().expect("decode") {
                break f;
            }
            let n = server_rd.read(&mut buf).await.expect("read");
            decoder.feed(&buf[..n]);
        };
        assert_eq!(frame.command, Command::SubmitJob);

        let created = Frame::new(Command::JobCreated, Bytes::from_static(b"H5"));
        server_wr.write_all(&encode_res(&created)).await.expect("write job created");
        server_wr.flush().await.expect("flush");

        // Two WORK_DATA chunks stream in before the job completes; both
        // must still be present once WORK_COMPLETE arrives, alongside the
        // completion payload itself.
        let chunk1 = Frame::new(Command::WorkData, Bytes::from_static(b"H5\0chunk1-"));
        server_wr.write_all(&encode_res(&chunk1)).await.expect("write chunk1");
        server_wr.flush().await.expect("flush");

        let chunk2 = Frame::new(Command::WorkData, Bytes::from_static(b"H5\0chunk2"));
        server_wr.write_all(&encode_res(&chunk2)).await.expect("write chunk2");
        server_wr.flush().await.expect("flush");

        let complete = Frame::new(Command::WorkComplete, Bytes::from_static(b"H5\0done"));
        server_wr.write_all(&encode_res(&complete)).await.expect("write complete");
        server_wr.flush().await.expect("flush");
    });

    let (_handle, outcome) = submitter
        .submit("reverse", "uniq", b"hello", SubmitMode::Normal)
        .await
        .expect("submit resolves");
    let outcome = outcome.expect("outcome present");
    assert_eq!(outcome.data.as_ref(), b"chunk1-chunk2");
    assert_eq!(outcome.completion.as_ref(), b"done");

    server_task.await.expect("server task");
}

#[tokio::test]
async fn background_submit_does_not_wait_for_completion() {
    let (client, server) = duplex(8192);
    let (client_rd, client_wr) = split(client);
    let session = Session::spawn(None, client_rd, client_wr);
    let submitter = Submitter::new(session).await;

    let (mut server_rd, mut server_wr) = split(server);

    let server_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::for_requests();
        let mut buf = [0u8; 4096];
        let frame = loop {
            if let Some(f) = decoder.decode_next().expect("decode") {
                break f;
            }
            let n = server_rd.read(&mut buf).await.expect("read");
            decoder.feed(&buf[..n]);
        };
        assert_eq!(frame.command, Command::SubmitJobBg);

        let created = Frame::new(Command::JobCreated, Bytes::from_static(b"H2"));
        server_wr.write_all(&encode_res(&created)).await.expect("write job created");
        server_wr.flush().await.expect("flush");
    });

    let handle = submitter
        .submit_background("reverse", "uniq", b"hello")
        .await
        .expect("background submit resolves");
    assert_eq!(handle, Bytes::from_static(b"H2"));

    server_task.await.expect("server task");
}

#[tokio::test]
async fn foreground_submit_fails_on_work_fail() {
    let (client, server) = duplex(8192);
    let (client_rd, client_wr) = split(client);
    let session = Session::spawn(None, client_rd, client_wr);
    let submitter = Submitter::new(session).await;

    let (mut server_rd, mut server_wr) = split(server);

    let server_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::for_requests();
        let mut buf = [0u8; 4096];
        loop {
            if decoder.decode_next().expect("decode").is_some() {
                break;
            }
            let n = server_rd.read(&mut buf).await.expect("read");
            decoder.feed(&buf[..n]);
        }

        let created = Frame::new(Command::JobCreated, Bytes::from_static(b"H3"));
        server_wr.write_all(&encode_res(&created)).await.expect("write job created");
        server_wr.flush().await.expect("flush");

        let fail = Frame::new(Command::WorkFail, Bytes::from_static(b"H3\0"));
        server_wr.write_all(&encode_res(&fail)).await.expect("write fail");
        server_wr.flush().await.expect("flush");
    });

    let result = submitter.submit("reverse", "uniq", b"hello", SubmitMode::Normal).await;
    assert!(result.is_err());

    server_task.await.expect("server task");
}

#[tokio::test]
async fn work_exception_is_informational_and_work_fail_is_authoritative() {
    let (client, server) = duplex(8192);
    let (client_rd, client_wr) = split(client);
    let session = Session::spawn(None, client_rd, client_wr);
    let submitter = Submitter::new(session).await;

    let (mut server_rd, mut server_wr) = split(server);

    let server_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::for_requests();
        let mut buf = [0u8; 4096];
        loop {
            if decoder.decode_next().expect("decode").is_some() {
                break;
            }
            let n = server_rd.read(&mut buf).await.expect("read");
            decoder.feed(&buf[..n]);
        }

        let created = Frame::new(Command::JobCreated, Bytes::from_static(b"H4"));
        server_wr.write_all(&encode_res(&created)).await.expect("write job created");
        server_wr.flush().await.expect("flush");

        // WORK_EXCEPTION must not resolve the caller's future by itself;
        // only the WORK_FAIL that follows it is authoritative.
        let exception = Frame::new(Command::WorkException, Bytes::from_static(b"H4\0Boom(bad input)"));
        server_wr.write_all(&encode_res(&exception)).await.expect("write exception");
        server_wr.flush().await.expect("flush");

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let fail = Frame::new(Command::WorkFail, Bytes::from_static(b"H4\0"));
        server_wr.write_all(&encode_res(&fail)).await.expect("write fail");
        server_wr.flush().await.expect("flush");
    });

    let result = submitter.submit("reverse", "uniq", b"hello", SubmitMode::Normal).await;
    assert!(result.is_err());
    assert!(!submitter.has_tracked_handle(&Bytes::from_static(b"H4")));

    server_task.await.expect("server task");
}
