// Line transports: standard streams or a single-client TCP socket.
// Reading happens on the caller's thread; writing is serialized through
// a channel onto a dedicated writer thread, so VM events and responses
// never interleave mid-line.

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;

#[derive(Debug, Clone)]
pub enum Transport {
    Stdio,
    Tcp(String),
}

pub struct Channel {
    reader: Box<dyn BufRead + Send>,
    out: Sender<String>,
    writer: WriterHandle,
}

pub struct WriterHandle(Option<JoinHandle<()>>);

impl WriterHandle {
    /// Wait for the writer to flush its queue and exit
    pub fn join(mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.join();
        }
    }
}

impl Channel {
    pub fn split(self) -> (Box<dyn BufRead + Send>, Sender<String>, WriterHandle) {
        (self.reader, self.out, self.writer)
    }
}

fn spawn_writer(mut sink: Box<dyn Write + Send>, rx: Receiver<String>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(line) = rx.recv() {
            if writeln!(sink, "{}", line).is_err() {
                break;
            }
            if sink.flush().is_err() {
                break;
            }
        }
    })
}

impl Transport {
    pub fn open(self) -> io::Result<Channel> {
        let (tx, rx) = channel::<String>();
        match self {
            Transport::Stdio => {
                let writer = spawn_writer(Box::new(io::stdout()), rx);
                Ok(Channel {
                    reader: Box::new(BufReader::new(io::stdin())),
                    out: tx,
                    writer: WriterHandle(Some(writer)),
                })
            }
            Transport::Tcp(addr) => {
                let listener = TcpListener::bind(&addr)?;
                tracing::info!(address = %addr, "waiting for debugger client");
                let (stream, peer) = listener.accept()?;
                tracing::info!(peer = %peer, "debugger client connected");
                let write_half = stream.try_clone()?;
                let writer = spawn_writer(Box::new(write_half), rx);
                Ok(Channel {
                    reader: Box::new(BufReader::new(stream)),
                    out: tx,
                    writer: WriterHandle(Some(writer)),
                })
            }
        }
    }
}
