//! Echo network filter: every byte goes straight back downstream.

use bytes::BytesMut;

use relayd_net::filter::{ConnectionOps, FilterStatus, ReadFilter};

pub struct EchoFilter;

impl ReadFilter for EchoFilter {
    fn on_data(&mut self, data: &mut BytesMut, conn: &mut dyn ConnectionOps) -> FilterStatus {
        conn.write(data);
        data.clear();
        FilterStatus::StopIteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    struct FakeOps {
        written: Vec<u8>,
    }

    impl ConnectionOps for FakeOps {
        fn write(&mut self, data: &[u8]) {
            self.written.extend_from_slice(data);
        }
        fn close(&mut self, _close_type: relayd_net::CloseType) {}
        fn read_disable(&mut self, _disable: bool) {}
        fn local_address(&self) -> SocketAddr {
            "127.0.0.1:1".parse().unwrap()
        }
        fn remote_address(&self) -> SocketAddr {
            "127.0.0.1:2".parse().unwrap()
        }
        fn id(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_echo_writes_input_back() {
        let mut ops = FakeOps { written: Vec::new() };
        let mut filter = EchoFilter;
        let mut data = BytesMut::from(&b"roundtrip"[..]);
        let status = filter.on_data(&mut data, &mut ops);
        assert_eq!(FilterStatus::StopIteration, status);
        assert!(data.is_empty());
        assert_eq!(b"roundtrip".as_slice(), ops.written.as_slice());
    }
}
