//! Listener accept-path integration tests: plain accept and echo, original
//! destination rehoming, proxy protocol, and address anchoring.

mod common;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use common::*;
use relayd_net::event::Dispatcher;
use relayd_net::{
    CloseType, Connection, ConnectionHandler, Listener, ListenerCallbacks, ListenerOptions,
    ListenSocket,
};
use relayd_stats::Store;

/// Listener callbacks that wire a CollectFilter onto every connection, with
/// an optional echo filter in front.
struct Collecting {
    connections: RefCell<Vec<HeldConnection>>,
    echo: bool,
}

impl Collecting {
    fn new() -> Rc<Collecting> {
        Rc::new(Collecting {
            connections: RefCell::new(Vec::new()),
            echo: false,
        })
    }

    fn echoing() -> Rc<Collecting> {
        Rc::new(Collecting {
            connections: RefCell::new(Vec::new()),
            echo: true,
        })
    }

    fn held(&self, index: usize) -> (Connection, Rc<RefCell<Vec<u8>>>) {
        let held = &self.connections.borrow()[index];
        (held.connection.clone(), held.data.clone())
    }
}

impl ListenerCallbacks for Collecting {
    fn on_new_connection(&self, connection: Connection) {
        let chunks = Rc::new(RefCell::new(Vec::new()));
        let data = Rc::new(RefCell::new(Vec::new()));
        let events = Rc::new(EventRecorder::default());
        if self.echo {
            connection.add_read_filter(Box::new(EchoBackFilter));
        }
        connection.add_read_filter(Box::new(CollectFilter {
            chunks: chunks.clone(),
            data: data.clone(),
        }));
        connection.add_connection_callbacks(events.clone());
        connection.set_no_delay(true);
        connection.init_filters();
        self.connections.borrow_mut().push(HeldConnection {
            connection,
            events,
            chunks,
            data,
        });
    }
}

struct NoHandler;

impl ConnectionHandler for NoHandler {
    fn find_listener_by_address(&self, _address: SocketAddr) -> Option<Listener> {
        None
    }
}

fn no_handler() -> (Rc<dyn ConnectionHandler>, Weak<dyn ConnectionHandler>) {
    let handler: Rc<dyn ConnectionHandler> = Rc::new(NoHandler);
    let weak = Rc::downgrade(&handler);
    (handler, weak)
}

#[test]
fn test_accept_and_receive_data() {
    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();
    let socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let addr = socket.local_address();

    let callbacks = Collecting::new();
    let cb_weak: Weak<dyn ListenerCallbacks> =
        Rc::downgrade(&(callbacks.clone() as Rc<dyn ListenerCallbacks>));
    let (_handler, handler_weak) = no_handler();

    let _listener = Listener::new(
        &dispatcher,
        handler_weak,
        socket,
        cb_weak,
        &store.scope("listener.test."),
        ListenerOptions {
            bind_to_port: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"hello listener").unwrap();

    assert!(run_until(&dispatcher, || {
        !callbacks.connections.borrow().is_empty()
            && callbacks.connections.borrow()[0].data.borrow().len() == 14
    }));

    let (conn, data) = callbacks.held(0);
    assert_eq!(b"hello listener".as_slice(), data.borrow().as_slice());
    assert_eq!(addr, conn.local_address());
    conn.close(CloseType::NoFlush);
}

#[test]
fn test_client_connection_round_trip() {
    // Server echoes through a filter; a client Connection driven by the same
    // dispatcher sees its bytes come back in order.
    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();
    let socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let addr = socket.local_address();

    let callbacks = Collecting::echoing();
    let (_handler, handler_weak) = no_handler();
    let _listener = Listener::new(
        &dispatcher,
        handler_weak,
        socket,
        Rc::downgrade(&(callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &store.scope("listener.test."),
        ListenerOptions {
            bind_to_port: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let client = Connection::connect(&dispatcher, addr).unwrap();
    let events = Rc::new(EventRecorder::default());
    client.add_connection_callbacks(events.clone());
    let chunks = Rc::new(RefCell::new(Vec::new()));
    let data = Rc::new(RefCell::new(Vec::new()));
    client.add_read_filter(Box::new(CollectFilter {
        chunks,
        data: data.clone(),
    }));
    client.init_filters();

    client.write(b"ping");
    assert!(run_until(&dispatcher, || data.borrow().len() == 4));
    assert_eq!(b"ping".as_slice(), data.borrow().as_slice());
    assert_eq!(1, events.connected.get());

    client.close(CloseType::FlushWrite);
    assert_eq!(1, events.local_close.get());
}

#[test]
fn test_original_dst_rehomes_to_anchor_listener() {
    struct OneListenerHandler {
        listener: RefCell<Option<Listener>>,
        expected: SocketAddr,
    }
    impl ConnectionHandler for OneListenerHandler {
        fn find_listener_by_address(&self, address: SocketAddr) -> Option<Listener> {
            if address == self.expected {
                self.listener.borrow().clone()
            } else {
                None
            }
        }
    }

    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();

    // The anchor listener owns the intercepted destination address but does
    // not accept; redirected connections land on it via the handler map.
    let anchor_addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
    let anchor_socket = std::sync::Arc::new(ListenSocket::bind(anchor_addr, false).unwrap());
    let accept_socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let accept_addr = accept_socket.local_address();

    let handler = Rc::new(OneListenerHandler {
        listener: RefCell::new(None),
        expected: anchor_addr,
    });
    let handler_dyn: Rc<dyn ConnectionHandler> = handler.clone();

    let anchor_callbacks = Collecting::new();
    let anchor_listener = Listener::new(
        &dispatcher,
        Rc::downgrade(&handler_dyn),
        anchor_socket,
        Rc::downgrade(&(anchor_callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &store.scope("listener.anchor."),
        ListenerOptions::default(),
        None,
    )
    .unwrap();
    *handler.listener.borrow_mut() = Some(anchor_listener);

    let accept_callbacks = Collecting::new();
    let accept_listener = Listener::new(
        &dispatcher,
        Rc::downgrade(&handler_dyn),
        accept_socket,
        Rc::downgrade(&(accept_callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &store.scope("listener.accept."),
        ListenerOptions {
            bind_to_port: true,
            use_original_dst: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    // Pretend the kernel says every socket was intercepted on the way to the
    // anchor address.
    accept_listener.set_original_dst_resolver(move |_fd| Some(anchor_addr));

    let mut client = std::net::TcpStream::connect(accept_addr).unwrap();
    client.write_all(b"redirected").unwrap();

    assert!(run_until(&dispatcher, || {
        !anchor_callbacks.connections.borrow().is_empty()
            && anchor_callbacks.connections.borrow()[0].data.borrow().len() == 10
    }));

    // The accepting listener handed the connection off wholesale.
    assert!(accept_callbacks.connections.borrow().is_empty());
    let (conn, _) = anchor_callbacks.held(0);
    assert_eq!(anchor_addr, conn.local_address());
}

#[test]
fn test_original_dst_unredirected_stays_local() {
    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();
    let socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let addr = socket.local_address();

    let callbacks = Collecting::new();
    let (_handler, handler_weak) = no_handler();
    let listener = Listener::new(
        &dispatcher,
        handler_weak,
        socket,
        Rc::downgrade(&(callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &store.scope("listener.test."),
        ListenerOptions {
            bind_to_port: true,
            use_original_dst: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();
    // Unredirected traffic reports the listener's own address.
    let own = addr;
    listener.set_original_dst_resolver(move |_fd| Some(own));

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"direct").unwrap();

    assert!(run_until(&dispatcher, || {
        !callbacks.connections.borrow().is_empty()
            && callbacks.connections.borrow()[0].data.borrow().len() == 6
    }));
    let (conn, _) = callbacks.held(0);
    assert_eq!(addr, conn.local_address());
}

#[test]
fn test_proxy_protocol_sets_remote_address() {
    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();
    let socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let addr = socket.local_address();

    let callbacks = Collecting::new();
    let (_handler, handler_weak) = no_handler();
    let _listener = Listener::new(
        &dispatcher,
        handler_weak,
        socket,
        Rc::downgrade(&(callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &store.scope("listener.test."),
        ListenerOptions {
            bind_to_port: true,
            use_proxy_proto: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client
        .write_all(b"PROXY TCP4 254.254.254.254 127.0.0.1 65535 1234\r\npayload")
        .unwrap();

    assert!(run_until(&dispatcher, || {
        !callbacks.connections.borrow().is_empty()
            && callbacks.connections.borrow()[0].data.borrow().len() == 7
    }));

    let (conn, data) = callbacks.held(0);
    assert_eq!(b"payload".as_slice(), data.borrow().as_slice());
    assert_eq!("254.254.254.254:65535", conn.remote_address().to_string());
}

#[test]
fn test_proxy_protocol_malformed_closes_before_filters() {
    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();
    let scope = store.scope("listener.test.");
    let socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let addr = socket.local_address();

    let callbacks = Collecting::new();
    let (_handler, handler_weak) = no_handler();
    let _listener = Listener::new(
        &dispatcher,
        handler_weak,
        socket,
        Rc::downgrade(&(callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &scope,
        ListenerOptions {
            bind_to_port: true,
            use_proxy_proto: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let error_counter = scope.counter("downstream_cx_proxy_proto_error");

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n").unwrap();

    assert!(run_until(&dispatcher, || error_counter.value() == 1));

    // No filter ever saw the connection.
    assert!(callbacks.connections.borrow().is_empty());

    // The socket was closed under the client.
    let mut buf = [0u8; 8];
    client
        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
        .unwrap();
    assert_eq!(0, client.read(&mut buf).unwrap());
}

#[test]
fn test_disabled_listener_stops_accepting() {
    let dispatcher = Dispatcher::new().unwrap();
    let store = Store::isolated();
    let socket = std::sync::Arc::new(ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap());
    let addr = socket.local_address();

    let callbacks = Collecting::new();
    let (_handler, handler_weak) = no_handler();
    let listener = Listener::new(
        &dispatcher,
        handler_weak,
        socket,
        Rc::downgrade(&(callbacks.clone() as Rc<dyn ListenerCallbacks>)),
        &store.scope("listener.test."),
        ListenerOptions {
            bind_to_port: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    listener.disable();

    // Connects still complete against the kernel backlog, but no connection
    // object is ever surfaced.
    let _client = std::net::TcpStream::connect(addr).unwrap();
    for _ in 0..50 {
        dispatcher.run(relayd_net::event::RunType::NonBlock);
    }
    assert!(callbacks.connections.borrow().is_empty());
}
