//! End-to-end tests over in-memory duplex transports.
//!
//! Each test plays the controller's side of the wire by hand: it reads the
//! lines the driver sends and answers with scripted response envelopes and
//! status reports, then asserts on the driver's externally visible
//! behavior.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

use tinyg_driver::{DynSerial, Event, MachineState, OpenOptions, Tinyg, TinygError};

const WAIT: Duration = Duration::from_secs(5);

type DeviceReader = BufReader<ReadHalf<DuplexStream>>;
type DeviceWriter = WriteHalf<DuplexStream>;

fn transport() -> (DynSerial, DeviceReader, DeviceWriter) {
    let (host, device) = tokio::io::duplex(4096);
    let (rx, tx) = tokio::io::split(device);
    (Box::new(host), BufReader::new(rx), tx)
}

fn no_setup() -> OpenOptions {
    OpenOptions {
        dont_setup: true,
        ..OpenOptions::default()
    }
}

async fn device_reads(reader: &mut DeviceReader) -> String {
    let mut line = String::new();
    timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line from the driver")
        .expect("device-side read failed");
    line.trim_end().to_string()
}

async fn device_sends(writer: &mut DeviceWriter, line: &str) {
    writer
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .expect("device-side write failed");
}

/// Open a single-channel connection and answer the rx priming query so the
/// driver starts with `rx - 1` credit.
async fn open_primed(tinyg: &Tinyg, rx: i64) -> (DeviceReader, DeviceWriter) {
    let (host, mut reader, mut writer) = transport();
    tinyg
        .open_with_transport(host, None, &no_setup())
        .await
        .expect("open failed");
    assert_eq!(device_reads(&mut reader).await, r#"{"rx":null}"#);
    device_sends(&mut writer, &format!(r#"{{"r":{{"rx":{rx}}},"f":[1,0,11]}}"#)).await;
    wait_for_credit(tinyg, rx - 1).await;
    (reader, writer)
}

async fn wait_for_credit(tinyg: &Tinyg, expected: i64) {
    timeout(WAIT, async {
        loop {
            if tinyg.send_credit().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("credit never settled at {expected}"));
}

async fn wait_for_event<F>(events: &mut tokio::sync::broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event channel failed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn open_primes_packet_mode_flow_control() {
    let tinyg = Tinyg::new();
    let _device = open_primed(&tinyg, 5).await;
    assert!(tinyg.is_open().await);
    assert_eq!(tinyg.send_credit().await, 4);
}

#[tokio::test]
async fn opening_twice_fails() {
    let tinyg = Tinyg::new();
    let _device = open_primed(&tinyg, 5).await;
    let (host, _r, _w) = transport();
    let result = tinyg.open_with_transport(host, None, &no_setup()).await;
    assert!(matches!(result, Err(TinygError::AlreadyOpen(_))));
}

#[tokio::test]
async fn responses_pace_the_pending_queue() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 2).await;

    // One credit: the first line goes out, the second waits.
    tinyg.write("g0 x1").await.expect("write failed");
    tinyg.write("g0 x2").await.expect("write failed");
    assert_eq!(device_reads(&mut reader).await, "g0 x1");
    assert_eq!(tinyg.queued_lines().await, 1);

    // Acknowledging the first line releases the second.
    device_sends(&mut writer, r#"{"r":{},"f":[1,0,6]}"#).await;
    assert_eq!(device_reads(&mut reader).await, "g0 x2");
}

#[tokio::test]
async fn out_of_band_acknowledgement_grants_no_credit() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 2).await;

    tinyg.write("g0 x1").await.expect("write failed");
    tinyg.write("g0 x2").await.expect("write failed");
    assert_eq!(device_reads(&mut reader).await, "g0 x1");

    // A direct record bypasses the queue; its acknowledgement is consumed
    // by the ignored counter and must not release the queued line.
    tinyg
        .write_record(json!({"sr": null}))
        .await
        .expect("write_record failed");
    assert_eq!(device_reads(&mut reader).await, r#"{"sr":null}"#);
    device_sends(&mut writer, r#"{"r":{"sr":{}},"f":[1,0,10]}"#).await;
    wait_for_credit(&tinyg, 0).await;
    assert_eq!(tinyg.queued_lines().await, 1);

    // The next acknowledgement counts again.
    device_sends(&mut writer, r#"{"r":{},"f":[1,0,6]}"#).await;
    assert_eq!(device_reads(&mut reader).await, "g0 x2");
}

#[tokio::test]
async fn set_resolves_with_the_echoed_value() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;

    let device = async {
        assert_eq!(device_reads(&mut reader).await, r#"{"xvm":12000}"#);
        device_sends(&mut writer, r#"{"r":{"xvm":12000},"f":[1,0,16]}"#).await;
    };
    let (result, ()) = tokio::join!(tinyg.set("xvm", json!(12000)), device);
    assert_eq!(result.expect("set failed"), json!(12000));
}

#[tokio::test]
async fn get_sends_a_null_query() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;

    let device = async {
        assert_eq!(device_reads(&mut reader).await, r#"{"fv":null}"#);
        device_sends(&mut writer, r#"{"r":{"fv":0.99},"f":[1,0,10]}"#).await;
    };
    let (result, ()) = tokio::join!(tinyg.get("fv"), device);
    assert_eq!(result.expect("get failed"), json!(0.99));
}

#[tokio::test]
async fn device_error_footer_rejects_the_request() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;

    let device = async {
        assert_eq!(device_reads(&mut reader).await, r#"{"bogus":1}"#);
        device_sends(&mut writer, r#"{"r":{},"f":[1,108,10]}"#).await;
    };
    let (result, ()) = tokio::join!(tinyg.set("bogus", json!(1)), device);
    assert!(matches!(result, Err(TinygError::DeviceSyntax { .. })));
}

#[tokio::test]
async fn set_many_continues_past_failures() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;

    let device = async {
        assert_eq!(device_reads(&mut reader).await, r#"{"jv":4}"#);
        device_sends(&mut writer, r#"{"r":{},"f":[1,108,7]}"#).await;
        assert_eq!(device_reads(&mut reader).await, r#"{"qv":2}"#);
        device_sends(&mut writer, r#"{"r":{"qv":2},"f":[1,0,7]}"#).await;
    };
    let pairs = vec![
        ("jv".to_string(), json!(4)),
        ("qv".to_string(), json!(2)),
    ];
    let (outcomes, ()) = tokio::join!(tinyg.set_many(pairs), device);
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].1.is_err());
    assert_eq!(outcomes[1].1.as_ref().expect("qv failed"), &json!(2));
}

#[tokio::test]
async fn status_reports_track_hold_and_line() {
    let tinyg = Tinyg::new();
    let (_reader, mut writer) = open_primed(&tinyg, 5).await;
    let mut events = tinyg.subscribe();

    device_sends(&mut writer, r#"{"sr":{"stat":6,"line":12}}"#).await;
    let event = wait_for_event(&mut events, |e| matches!(e, Event::StatusChanged(_))).await;
    let Event::StatusChanged(report) = event else {
        unreachable!()
    };
    assert_eq!(report.machine_state(), Some(MachineState::Hold));
    assert!(tinyg.in_hold().await);
    assert_eq!(tinyg.last_status_line().await, Some(12));

    device_sends(&mut writer, r#"{"sr":{"stat":5}}"#).await;
    wait_for_event(&mut events, |e| matches!(e, Event::StatusChanged(_))).await;
    assert!(!tinyg.in_hold().await);
    // Line is sticky across reports that omit it.
    assert_eq!(tinyg.last_status_line().await, Some(12));
}

#[tokio::test]
async fn alarm_fails_outstanding_requests() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;
    let mut events = tinyg.subscribe();

    let device = async {
        assert_eq!(device_reads(&mut reader).await, r#"{"xvm":1}"#);
        device_sends(&mut writer, r#"{"sr":{"stat":2}}"#).await;
    };
    let (result, ()) = tokio::join!(tinyg.set("xvm", json!(1)), device);
    assert!(matches!(result, Err(TinygError::Alarm)));
    wait_for_event(&mut events, |e| matches!(e, Event::Error(TinygError::Alarm))).await;
}

#[tokio::test]
async fn send_stream_renumbers_and_completes_after_both_signals() {
    let tinyg = Tinyg::new();
    let (host, mut reader, mut writer) = transport();
    tinyg
        .open_with_transport(host, None, &no_setup())
        .await
        .expect("open failed");

    let device = tokio::spawn(async move {
        assert_eq!(device_reads(&mut reader).await, r#"{"rx":null}"#);
        device_sends(&mut writer, r#"{"r":{"rx":4},"f":[1,0,11]}"#).await;

        // Existing numbering on the last line is replaced.
        for expected in ["N1 g0 x1", "N2 g0 x2", "N3 g0 x3"] {
            assert_eq!(device_reads(&mut reader).await, expected);
            device_sends(&mut writer, r#"{"r":{},"f":[1,0,6]}"#).await;
        }
        device_sends(&mut writer, r#"{"sr":{"stat":5}}"#).await;
        device_sends(&mut writer, r#"{"sr":{"stat":3}}"#).await;
        // Hand the transport back so the port stays up until the session
        // has finished; the hangup case has its own test.
        (reader, writer)
    });

    let gcode = b"g0 x1\ng0 x2\nN99 g0 x3\n";
    timeout(WAIT, tinyg.send_stream(&gcode[..]))
        .await
        .expect("stream timed out")
        .expect("stream failed");
    let _transport = device.await.expect("device script panicked");
}

#[tokio::test]
async fn send_stream_completes_when_device_hangs_up_after_stop() {
    let tinyg = Tinyg::new();
    let (host, mut reader, mut writer) = transport();
    tinyg
        .open_with_transport(host, None, &no_setup())
        .await
        .expect("open failed");

    let device = tokio::spawn(async move {
        assert_eq!(device_reads(&mut reader).await, r#"{"rx":null}"#);
        device_sends(&mut writer, r#"{"r":{"rx":4},"f":[1,0,11]}"#).await;
        for expected in ["N1 g0 x1", "N2 g0 x2"] {
            assert_eq!(device_reads(&mut reader).await, expected);
            device_sends(&mut writer, r#"{"r":{},"f":[1,0,6]}"#).await;
        }
        device_sends(&mut writer, r#"{"sr":{"stat":3}}"#).await;
        // Both halves drop here. The Close that follows must not beat the
        // session's own drain-complete signal; completion was already
        // satisfied when the stop report arrived.
    });

    let gcode = b"g0 x1\ng0 x2\n";
    timeout(WAIT, tinyg.send_stream(&gcode[..]))
        .await
        .expect("stream timed out")
        .expect("stream failed");
    device.await.expect("device script panicked");
}

#[tokio::test]
async fn send_stream_fails_on_alarm() {
    let tinyg = Tinyg::new();
    let (host, mut reader, mut writer) = transport();
    tinyg
        .open_with_transport(host, None, &no_setup())
        .await
        .expect("open failed");

    let device = tokio::spawn(async move {
        assert_eq!(device_reads(&mut reader).await, r#"{"rx":null}"#);
        device_sends(&mut writer, r#"{"r":{"rx":4},"f":[1,0,11]}"#).await;
        assert_eq!(device_reads(&mut reader).await, "N1 g0 x1");
        device_sends(&mut writer, r#"{"sr":{"stat":2}}"#).await;
    });

    let gcode = b"g0 x1\ng0 x2\n";
    let result = timeout(WAIT, tinyg.send_stream(&gcode[..]))
        .await
        .expect("stream timed out");
    assert!(matches!(result, Err(TinygError::Alarm)));
    device.await.expect("device script panicked");
}

#[tokio::test]
async fn send_file_streams_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("part.gcode");
    std::fs::write(&path, "g0 x1\ng0 x2\n").expect("write failed");

    let tinyg = Tinyg::new();
    let (host, mut reader, mut writer) = transport();
    tinyg
        .open_with_transport(host, None, &no_setup())
        .await
        .expect("open failed");

    let device = tokio::spawn(async move {
        assert_eq!(device_reads(&mut reader).await, r#"{"rx":null}"#);
        device_sends(&mut writer, r#"{"r":{"rx":4},"f":[1,0,11]}"#).await;
        for expected in ["N1 g0 x1", "N2 g0 x2"] {
            assert_eq!(device_reads(&mut reader).await, expected);
            device_sends(&mut writer, r#"{"r":{},"f":[1,0,6]}"#).await;
        }
        device_sends(&mut writer, r#"{"sr":{"stat":3}}"#).await;
        (reader, writer)
    });

    timeout(WAIT, tinyg.send_file(&path))
        .await
        .expect("send_file timed out")
        .expect("send_file failed");
    let _transport = device.await.expect("device script panicked");
}

#[tokio::test]
async fn dual_channel_routes_by_line_shape() {
    let tinyg = Tinyg::new();
    let (control_host, mut control_reader, _control_writer) = transport();
    let (data_host, mut data_reader, _data_writer) = transport();
    tinyg
        .open_with_transport(control_host, Some(data_host), &no_setup())
        .await
        .expect("open failed");

    // Dual channel starts with wide-open credit; writes flow immediately.
    tinyg.write("g0 x1").await.expect("write failed");
    assert_eq!(device_reads(&mut data_reader).await, "g0 x1");

    tinyg
        .write_record(json!({"jv": 4}))
        .await
        .expect("write_record failed");
    assert_eq!(device_reads(&mut control_reader).await, r#"{"jv":4}"#);

    // Feedhold bypasses the queue and stays on the command channel.
    tinyg.write("!").await.expect("write failed");
    assert_eq!(device_reads(&mut control_reader).await, "!");
}

#[tokio::test]
async fn write_and_wait_returns_on_program_stop() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;

    let device = async {
        assert_eq!(device_reads(&mut reader).await, "g0 x10");
        device_sends(&mut writer, r#"{"r":{},"f":[1,0,7]}"#).await;
        device_sends(&mut writer, r#"{"sr":{"stat":5}}"#).await;
        device_sends(&mut writer, r#"{"sr":{"stat":3}}"#).await;
    };
    let (result, ()) = tokio::join!(tinyg.write_and_wait(&["g0 x10"]), device);
    result.expect("write_and_wait failed");
}

#[tokio::test]
async fn close_rejects_pending_requests() {
    let tinyg = Tinyg::new();
    let (_reader, _writer) = open_primed(&tinyg, 5).await;

    let closer = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tinyg.close().await.expect("close failed");
    };
    let (result, ()) = tokio::join!(tinyg.set("xvm", json!(1)), closer);
    assert!(matches!(result, Err(TinygError::Closed)));
    assert!(!tinyg.is_open().await);
    assert!(matches!(tinyg.close().await, Err(TinygError::NotOpen)));
}

#[tokio::test]
async fn device_hangup_closes_the_connection() {
    let tinyg = Tinyg::new();
    let mut events = tinyg.subscribe();
    let (reader, writer) = open_primed(&tinyg, 5).await;

    drop(reader);
    drop(writer);
    wait_for_event(&mut events, |e| matches!(e, Event::Close)).await;
    assert!(!tinyg.is_open().await);
}

#[tokio::test]
async fn undecodable_line_is_reported_but_not_fatal() {
    let tinyg = Tinyg::new();
    let (mut reader, mut writer) = open_primed(&tinyg, 5).await;
    let mut events = tinyg.subscribe();

    device_sends(&mut writer, "{this is not json").await;
    wait_for_event(
        &mut events,
        |e| matches!(e, Event::Error(TinygError::Decode { .. })),
    )
    .await;

    // The connection keeps working.
    let device = async {
        assert_eq!(device_reads(&mut reader).await, r#"{"fv":null}"#);
        device_sends(&mut writer, r#"{"r":{"fv":0.99},"f":[1,0,10]}"#).await;
    };
    let (result, ()) = tokio::join!(tinyg.get("fv"), device);
    assert_eq!(result.expect("get failed"), json!(0.99));
}

#[tokio::test]
async fn open_runs_the_setup_sequence() {
    let tinyg = Tinyg::new();
    let (host, mut reader, mut writer) = transport();

    let device = tokio::spawn(async move {
        assert_eq!(device_reads(&mut reader).await, r#"{"rx":null}"#);
        device_sends(&mut writer, r#"{"r":{"rx":8},"f":[1,0,11]}"#).await;
        for (expected, reply) in [
            (r#"{"jv":4}"#, r#"{"r":{"jv":4},"f":[1,0,7]}"#),
            (r#"{"ex":2}"#, r#"{"r":{"ex":2},"f":[1,0,7]}"#),
            (r#"{"qv":2}"#, r#"{"r":{"qv":2},"f":[1,0,7]}"#),
            (r#"{"rxm":1}"#, r#"{"r":{"rxm":1},"f":[1,0,8]}"#),
        ] {
            assert_eq!(device_reads(&mut reader).await, expected);
            device_sends(&mut writer, reply).await;
        }
    });

    timeout(
        WAIT,
        tinyg.open_with_transport(host, None, &OpenOptions::default()),
    )
    .await
    .expect("open timed out")
    .expect("open failed");
    device.await.expect("device script panicked");
}
