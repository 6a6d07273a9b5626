// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed RPC echo: one manager hosts both the listening server and
//! a client connection that sends a single message and shuts down.

use std::net::TcpListener;
use std::sync::Arc;

use conmgr::{
    Callbacks, ConFlags, Conmgr, Connection, ConnectionEvents, ConnectionKind, Ctx, RpcMsg,
    Settings, UnpackError,
};

struct EchoServer;

impl ConnectionEvents for EchoServer {
    fn on_msg(
        &self,
        mgr: &Conmgr,
        con: &mut Connection,
        msg: Result<RpcMsg, UnpackError>,
        _raw: Option<Vec<u8>>,
    ) -> std::io::Result<()> {
        let msg = msg.map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let payload = msg.downcast::<Vec<u8>>().expect("passthrough payload");
        println!("server: echoing {} bytes from {}", payload.len(), con.name());
        mgr.queue_write_msg(con, &payload)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

struct EchoClient;

impl ConnectionEvents for EchoClient {
    fn on_connection(&self, mgr: &Conmgr, con: &mut Connection) -> Option<Ctx> {
        mgr.queue_write_msg(con, b"hello, conmgr").expect("queue request");
        None
    }

    fn on_msg(
        &self,
        mgr: &Conmgr,
        con: &mut Connection,
        msg: Result<RpcMsg, UnpackError>,
        _raw: Option<Vec<u8>>,
    ) -> std::io::Result<()> {
        let msg = msg.map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let payload = msg.downcast::<Vec<u8>>().expect("passthrough payload");
        println!("client: got \"{}\"", String::from_utf8_lossy(&payload));
        mgr.close_con(con);
        mgr.request_shutdown();
        Ok(())
    }
}

fn main() {
    let mgr = Conmgr::new(Settings::default(), Callbacks::default()).expect("init manager");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    println!("listening on {addr}");

    mgr.process_fd_listen(
        listener.into(),
        ConnectionKind::Rpc,
        Arc::new(EchoServer),
        ConFlags::NONE,
    )
    .expect("register listener");

    mgr.create_connect_socket(
        ConnectionKind::Rpc,
        addr,
        Arc::new(EchoClient),
        ConFlags::NONE,
    )
    .expect("connect client");

    mgr.run(true).expect("run");
    mgr.fini();
}
