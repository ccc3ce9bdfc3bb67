//! End-to-end bus behavior over a star topology: one listener, several
//! dialers, every node both sending and receiving.

use anyhow::{bail, ensure, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use trellis::{Message, Socket};

const PEERS: usize = 5;
const COUNT: usize = 7;

async fn wait_for_pipes(socket: &Socket, n: usize) -> Result<()> {
    for _ in 0..500 {
        if socket.pipes().len() == n {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("pipe count never reached {n}");
}

/// Every node sends `COUNT` numbered messages tagged with its id; every node
/// must receive exactly `COUNT` messages from each other peer, in per-peer
/// order, and none of its own.
async fn bus_star(addr: &str) -> Result<()> {
    let mut sockets = Vec::with_capacity(PEERS);
    for id in 0..PEERS {
        let socket = Arc::new(Socket::new("bus")?);
        if id == 0 {
            socket.listen(addr).await?;
        } else {
            socket.dial(addr).await?;
        }
        sockets.push(socket);
    }

    // Traffic only reaches peers that are connected when it is sent, so
    // wait for the star to fully form before anyone talks.
    wait_for_pipes(&sockets[0], PEERS - 1).await?;
    for socket in &sockets[1..] {
        wait_for_pipes(socket, 1).await?;
    }

    let mut senders = Vec::new();
    for (id, socket) in sockets.iter().enumerate() {
        let socket = socket.clone();
        senders.push(tokio::spawn(async move {
            for seq in 0..COUNT {
                // Stagger sends so receivers get a chance to catch up.
                tokio::time::sleep(Duration::from_millis((id as u64 + seq as u64) % 5 + 1)).await;
                let mut message = Message::new(2);
                message.body_mut().extend_from_slice(&[id as u8, seq as u8]);
                socket.send(message).await?;
            }
            anyhow::Ok(())
        }));
    }

    let mut receivers = Vec::new();
    for (id, socket) in sockets.iter().enumerate() {
        let socket = socket.clone();
        receivers.push(tokio::spawn(async move {
            let mut next_seq = [0usize; PEERS];
            for _ in 0..(PEERS - 1) * COUNT {
                let message = socket.recv().await?;
                let body = message.body();
                ensure!(body.len() == 2, "peer {id}: wrong length {}", body.len());
                let (from, seq) = (body[0] as usize, body[1] as usize);
                ensure!(from < PEERS, "peer {id}: bogus sender {from}");
                ensure!(from != id, "peer {id}: received its own message");
                ensure!(
                    seq == next_seq[from],
                    "peer {id}: got {seq} from peer {from}, expected {}",
                    next_seq[from]
                );
                next_seq[from] += 1;
                message.free();
            }
            for (from, &count) in next_seq.iter().enumerate() {
                if from == id {
                    ensure!(count == 0, "peer {id}: counted its own messages");
                } else {
                    ensure!(
                        count == COUNT,
                        "peer {id}: got {count} messages from {from}, expected {COUNT}"
                    );
                }
            }
            anyhow::Ok(())
        }));
    }

    for sender in senders {
        sender.await??;
    }
    for receiver in receivers {
        receiver.await??;
    }
    for socket in &sockets {
        socket.close().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bus_star_over_tcp() -> Result<()> {
    tokio::time::timeout(Duration::from_secs(30), bus_star("tcp://127.0.0.1:3538"))
        .await
        .context("bus test timed out")?
}

#[tokio::test(flavor = "multi_thread")]
async fn bus_star_over_inproc() -> Result<()> {
    tokio::time::timeout(Duration::from_secs(30), bus_star("inproc://bus-star"))
        .await
        .context("bus test timed out")?
}
