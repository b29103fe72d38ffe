//! Voices connected over TCP.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;

use brahms::comms::Comms;
use brahms::params::ExecParams;

use crate::voices::{round_trip, run_voices};

fn connect(count: usize, params: &ExecParams) -> Vec<Comms> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let peers: Vec<SocketAddr> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap())
        .collect();

    // Connections are established concurrently since each voice waits for
    // its peers.
    thread::scope(|s| {
        let handles: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| {
                let peers = &peers;
                s.spawn(move || Comms::connect_sockets(index, listener, peers, params))
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    })
}

#[test]
fn data_crosses_voices_over_tcp() {
    let params = ExecParams::default().with_max_threads(2);
    let samples = Arc::new(Mutex::new(Vec::new()));

    let reports = run_voices(connect(2, &params), &params, |_| round_trip(samples.clone()));

    for (outcome, report) in &reports {
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert!(report.is_ok(), "{}", report);
        assert_eq!(report.environment().voice.count, 2);
    }

    let values: Vec<u64> = samples.lock().unwrap().iter().map(|s| s[0]).collect();
    assert_eq!(values, vec![0, 0, 2, 4, 6, 8, 10, 12, 14, 16]);
}

#[test]
fn voice_index_out_of_range_is_rejected() {
    let params = ExecParams::default();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // A single address cannot hold voice 1.
    assert!(Comms::connect_sockets(1, listener, &[addr], &params).is_err());
}
