//! End-to-end tests over the serial channel with a simulated MDB board.

use mdb_master::adapters::SerialChannel;
use mdb_master::message::{RequestMessage, ResponseMessage, BOARD_RESPONSE_PREFIX};
use mdb_master::peripheral::{MockPeripheral, Operation};
use mdb_master::{BusMaster, Peripheral, Sniffer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

/// Minimal board firmware: answers the commands the master and sniffer use
/// and records every line it receives. Peripheral polls (`R,33`) are answered
/// after `poll_delay`.
fn spawn_board(
    stream: DuplexStream,
    received: Arc<Mutex<Vec<String>>>,
    poll_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            received.lock().unwrap().push(line.clone());
            if line == "R,33" && !poll_delay.is_zero() {
                tokio::time::sleep(poll_delay).await;
            }
            let reply: &[u8] = match line.as_str() {
                "M,1" => b"m,ACK\r\n",
                "R,RESET" => b"",
                "R,33" => b"p,0933\r\n",
                // Mirrors the bus traffic as sniffed lines before the reply.
                "R,30" => b"x,30\r\nx,00\r\np,ACK\r\n",
                "X,1" => b"x,ACK\r\n",
                "X,0" => b"x,ACK\r\n",
                _ => b"p,NACK\r\n",
            };
            if !reply.is_empty() && write_half.write_all(reply).await.is_err() {
                break;
            }
        }
    })
}

fn board() -> (SerialChannel, Arc<Mutex<Vec<String>>>, JoinHandle<()>) {
    board_with_poll_delay(Duration::ZERO)
}

fn board_with_poll_delay(
    poll_delay: Duration,
) -> (SerialChannel, Arc<Mutex<Vec<String>>>, JoinHandle<()>) {
    let (host, device) = duplex(4096);
    let received = Arc::new(Mutex::new(Vec::new()));
    let task = spawn_board(device, received.clone(), poll_delay);
    let channel = SerialChannel::from_stream(host, "sim-board", Duration::from_millis(500));
    (channel, received, task)
}

#[tokio::test]
async fn test_master_session_over_serial_board() {
    let (channel, received, _board) = board();
    let coin_acceptor = MockPeripheral::new("coin_acceptor").with_poll_command("R,33", "p");

    let mut master = BusMaster::new("serial");
    let peripherals: Vec<Box<dyn Peripheral>> = vec![Box::new(coin_acceptor.clone())];
    master
        .initialize(Box::new(channel.clone()), peripherals, true)
        .await
        .unwrap();

    assert_eq!(coin_acceptor.calls_to(Operation::Initialize).len(), 1);

    let request = RequestMessage::new(0x33);
    let raw = master
        .sendread(&request.pack(), BOARD_RESPONSE_PREFIX)
        .await
        .unwrap();
    let response = ResponseMessage::unpack(&raw).unwrap();
    assert_eq!(response.data(), Some(&[0x09, 0x33][..]));

    let raw = master
        .sendread(&RequestMessage::new(0x30).pack(), BOARD_RESPONSE_PREFIX)
        .await
        .unwrap();
    assert!(ResponseMessage::unpack(&raw).unwrap().is_ack());

    assert_eq!(
        received.lock().unwrap().clone(),
        vec!["M,1", "R,RESET", "R,33", "R,33", "R,30"]
    );
    channel.shutdown();
}

#[tokio::test]
async fn test_sniffer_shares_the_board_with_the_master() {
    let (channel, received, _board) = board();

    let mut sniffer = Sniffer::new();
    sniffer.initialize(&channel).await.unwrap();

    let mut master = BusMaster::new("serial");
    master
        .initialize(Box::new(channel.clone()), Vec::new(), false)
        .await
        .unwrap();

    // Sniffed traffic must not satisfy the master's peripheral exchanges.
    let raw = master.sendread("R,30", BOARD_RESPONSE_PREFIX).await.unwrap();
    assert_eq!(raw, "p,ACK");

    // Let the sniffer drain what the board mirrored, then stop it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = tokio::time::timeout(Duration::from_millis(100), sniffer.run()).await;
    assert_eq!(sniffer.sniffed(), 2);

    sniffer.shutdown().await.unwrap();
    assert!(received.lock().unwrap().contains(&"X,0".to_string()));
    channel.shutdown();
}

#[tokio::test]
async fn test_master_reusable_after_run_is_dropped_mid_poll() {
    let (channel, _received, _board) = board_with_poll_delay(Duration::from_millis(150));
    let coin_acceptor = MockPeripheral::new("coin_acceptor")
        .with_poll_command("R,33", "p")
        .with_poll_interval(Duration::from_millis(5));

    let mut master = BusMaster::new("serial");
    let peripherals: Vec<Box<dyn Peripheral>> = vec![Box::new(coin_acceptor.clone())];
    master
        .initialize(Box::new(channel.clone()), peripherals, false)
        .await
        .unwrap();

    // Stop the loops while a poll is still waiting for the slow board.
    let outcome = tokio::select! {
        result = master.run() => Some(result),
        _ = tokio::time::sleep(Duration::from_millis(50)) => None,
    };
    assert!(outcome.is_none());

    let outcomes = master.disable().await.unwrap();
    assert!(outcomes[0].is_ok());

    // Let the late answer to the abandoned poll arrive and be discarded.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let raw = master.sendread("R,30", BOARD_RESPONSE_PREFIX).await.unwrap();
    assert_eq!(raw, "p,ACK");
    channel.shutdown();
}

#[tokio::test]
async fn test_line_noise_does_not_kill_the_session() {
    let (host, mut device) = duplex(4096);
    let channel = SerialChannel::from_stream(host, "noisy-board", Duration::from_millis(500));
    device.write_all(b"\xff\xfe\r\n").await.unwrap();
    let _board = spawn_board(device, Arc::new(Mutex::new(Vec::new())), Duration::ZERO);

    let mut master = BusMaster::new("serial");
    master
        .initialize(Box::new(channel.clone()), Vec::new(), false)
        .await
        .unwrap();
    assert!(master.is_established());
    channel.shutdown();
}

#[tokio::test]
async fn test_silent_board_times_out_the_handshake() {
    let (host, mut device) = duplex(1024);
    let channel = SerialChannel::from_stream(host, "silent-board", Duration::from_millis(50));

    let mut master = BusMaster::new("serial");
    let err = master
        .initialize(Box::new(channel), Vec::new(), true)
        .await
        .unwrap_err();

    assert!(err.is_channel_error());
    assert!(!master.is_established());

    let mut line = String::new();
    let mut reader = BufReader::new(&mut device);
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "M,1\n");
}
