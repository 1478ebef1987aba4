// SPDX-License-Identifier: AGPL-3.0-or-later
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use logpipe::collector::{Collector, CollectorConfig, Stats};
use logpipe::wire::{recv_message, send_message, Message, SESSION_ID_LEN};

pub struct TestCollector {
    pub addr: SocketAddr,
    pub out: Arc<Mutex<Vec<u8>>>,
    pub stats: Arc<Stats>,
}

impl TestCollector {
    pub fn start(config: CollectorConfig) -> Self {
        let collector = Collector::bind("127.0.0.1:0", config).unwrap();
        let addr = collector.local_addr().unwrap();
        let stats = collector.stats();
        let out = Arc::new(Mutex::new(Vec::new()));
        let served = out.clone();
        thread::spawn(move || collector.serve(served));
        Self { addr, out, stats }
    }

    pub fn output(&self) -> String {
        String::from_utf8(self.out.lock().unwrap().clone()).unwrap()
    }

    /// Polls until `cond` holds, giving up after a few seconds.
    pub fn wait_for(&self, cond: impl Fn(&Stats) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond(&self.stats) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

/// Plays the collector's side of the session opening on the next connection.
pub fn handshake(listener: &TcpListener) -> TcpStream {
    let (mut s, _) = listener.accept().unwrap();
    assert!(matches!(recv_message(&mut s).unwrap(), Some(Message::Hello { .. })));
    send_message(&mut s, &Message::Accepted { session: [7; SESSION_ID_LEN] }).unwrap();
    assert_eq!(recv_message(&mut s).unwrap(), Some(Message::Ping));
    send_message(&mut s, &Message::Pong).unwrap();
    s
}
