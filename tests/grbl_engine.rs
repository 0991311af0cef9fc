//! End-to-end scenarios for `Engine` driven over a loopback TCP pair, with
//! the accepted side standing in for the firmware.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowport::grbl::GrblHandler;
use flowport::{CommandResponse, EngineBuilder};

struct DeviceSide {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

fn connected_pair() -> (TcpStream, DeviceSide) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    accepted.set_nodelay(true).ok();
    client.set_nodelay(true).ok();
    let device = DeviceSide {
        reader: BufReader::new(accepted.try_clone().unwrap()),
        writer: accepted,
    };
    (client, device)
}

impl DeviceSide {
    fn recv_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }

    fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
        self.writer.flush().unwrap();
    }
}

fn collecting_callbacks() -> (
    Arc<Mutex<Vec<String>>>,
    Arc<Mutex<Vec<CommandResponse>>>,
    impl Fn(String) + Send + Sync + 'static,
    impl Fn(CommandResponse) + Send + Sync + 'static,
) {
    let reads = Arc::new(Mutex::new(Vec::new()));
    let updates = Arc::new(Mutex::new(Vec::new()));
    let reads_cb = reads.clone();
    let updates_cb = updates.clone();
    (
        reads,
        updates,
        move |line: String| reads_cb.lock().unwrap().push(line),
        move |resp: CommandResponse| updates_cb.lock().unwrap().push(resp),
    )
}

fn wait_for<F: Fn() -> bool>(pred: F) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition never became true");
}

#[test]
fn single_command_completes_with_ok() {
    let (client, mut device) = connected_pair();
    let (_, updates, on_read, on_update) = collecting_callbacks();

    let engine = EngineBuilder::new()
        .handler(GrblHandler::new())
        .on_read(on_read)
        .on_update(on_update)
        .build(client)
        .unwrap();

    engine.queue_command("move-1", "G0X1").unwrap();
    assert_eq!(device.recv_line(), "G0X1");
    device.send_line("ok");

    wait_for(|| {
        updates
            .lock()
            .unwrap()
            .iter()
            .any(|r| matches!(r, CommandResponse::Done(item) if item.id == "move-1"))
    });

    engine.close();
}

#[test]
fn multi_line_submission_expands_and_each_line_is_acked() {
    let (client, mut device) = connected_pair();
    let (_, updates, on_read, on_update) = collecting_callbacks();

    let engine = EngineBuilder::new()
        .handler(GrblHandler::new())
        .on_read(on_read)
        .on_update(on_update)
        .build(client)
        .unwrap();

    engine.queue_command("batch", "G0X1\nG0Y1").unwrap();

    assert_eq!(device.recv_line(), "G0X1");
    device.send_line("ok");
    assert_eq!(device.recv_line(), "G0Y1");
    device.send_line("ok");

    wait_for(|| {
        updates
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, CommandResponse::Done(item) if item.id == "batch"))
            .count()
            == 2
    });

    engine.close();
}

#[test]
fn writes_block_once_device_buffer_is_full() {
    let (client, mut device) = connected_pair();
    let (_, _updates, on_read, on_update) = collecting_callbacks();

    let engine = EngineBuilder::new()
        .handler(GrblHandler::new())
        .on_read(on_read)
        .on_update(on_update)
        .build(client)
        .unwrap();

    // Each line is 120 bytes of payload; two in flight would exceed Grbl's
    // 125-byte cap, so the second must wait for the first's "ok".
    let long_line = "x".repeat(120);
    engine.queue_command("a", &long_line).unwrap();
    engine.queue_command("b", &long_line).unwrap();

    assert_eq!(device.recv_line(), long_line);

    // Give the dispatch loop a moment; the second line must not appear yet.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.write_queue_len(), 1);

    device.send_line("ok");
    assert_eq!(device.recv_line(), long_line);
    device.send_line("ok");

    wait_for(|| engine.write_queue_len() == 0);
    engine.close();
}

#[test]
fn jog_commands_bypass_the_normal_queue() {
    let (client, mut device) = connected_pair();
    let (_, _updates, on_read, on_update) = collecting_callbacks();

    let engine = EngineBuilder::new()
        .handler(GrblHandler::new())
        .on_read(on_read)
        .on_update(on_update)
        .build(client)
        .unwrap();

    // Fill the normal queue's admission slot so the next normal write must
    // wait for a response, then submit a jog command: it should be written
    // first via the priority queue despite being queued second.
    let filler = "x".repeat(120);
    engine.queue_command("fill", &filler).unwrap();
    assert_eq!(device.recv_line(), filler);

    engine.queue_command("fill2", &filler).unwrap();
    engine.queue_command("jog", "$J=X1").unwrap();

    device.send_line("ok"); // unblocks room for exactly one more write
    let next = device.recv_line();
    assert_eq!(next, "$J=X1", "priority queue should win the race");

    device.send_line("ok");
    assert_eq!(device.recv_line(), filler);
    device.send_line("ok");

    engine.close();
}

#[test]
fn device_reset_banner_cancels_in_flight_commands() {
    let (client, mut device) = connected_pair();
    let (_, updates, on_read, on_update) = collecting_callbacks();

    let engine = EngineBuilder::new()
        .handler(GrblHandler::new())
        .on_read(on_read)
        .on_update(on_update)
        .build(client)
        .unwrap();

    engine.queue_command("pending", "G0X1").unwrap();
    assert_eq!(device.recv_line(), "G0X1");

    device.send_line("Grbl 1.1h ['$' for help]");

    wait_for(|| {
        updates.lock().unwrap().iter().any(|r| {
            matches!(r, CommandResponse::Error(item, flowport::Error::Reset) if item.id == "pending")
        })
    });

    engine.close();
}

#[test]
fn inline_comments_and_spaces_are_stripped_before_transmission() {
    let (client, mut device) = connected_pair();
    let (_, _updates, on_read, on_update) = collecting_callbacks();

    let engine = EngineBuilder::new()
        .handler(GrblHandler::new())
        .on_read(on_read)
        .on_update(on_update)
        .build(client)
        .unwrap();

    engine
        .queue_command("c", "G0 X1 Y2 (rapid move) ; go to start")
        .unwrap();

    assert_eq!(device.recv_line(), "G0X1Y2");
    device.send_line("ok");

    engine.close();
}
