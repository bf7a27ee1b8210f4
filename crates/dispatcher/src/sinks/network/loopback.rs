//! Scripted MQTT 3.1.1 broker on a loopback socket
//!
//! Speaks just enough of the protocol to accept a session, answer
//! SUBSCRIBE and PINGREQ, and drop the connection when a test says so.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

pub struct LoopbackBroker {
    listener: TcpListener,
}

impl LoopbackBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accept one client, read its CONNECT and grant the session
    pub async fn accept(&self) -> BrokerSession {
        let (mut stream, _) = self.listener.accept().await.unwrap();
        let (kind, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(kind, CONNECT, "first packet must be CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        BrokerSession { stream }
    }
}

pub struct BrokerSession {
    stream: TcpStream,
}

impl BrokerSession {
    /// Serve the client until it sends SUBSCRIBE; returns the first filter
    pub async fn expect_subscribe(&mut self) -> String {
        loop {
            let (kind, body) = read_packet(&mut self.stream).await.unwrap();
            match kind {
                SUBSCRIBE => {
                    self.stream
                        .write_all(&[0x90, 0x03, body[0], body[1], 0x02])
                        .await
                        .unwrap();
                    let len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    return String::from_utf8(body[4..4 + len].to_vec()).unwrap();
                }
                PINGREQ => self.stream.write_all(&[0xD0, 0x00]).await.unwrap(),
                PUBLISH | DISCONNECT => {}
                other => panic!("unexpected packet type {other}"),
            }
        }
    }
}

/// Packet type and body of the next control packet
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header >> 4, body))
}
