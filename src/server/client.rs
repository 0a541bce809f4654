use mio::net::TcpStream;
use session_protocol::{CommandDecoder, Outbox};

/// One accepted connection: the socket plus its decode and reply buffers.
pub struct Client {
    pub stream: TcpStream,
    pub decoder: CommandDecoder,
    pub outbox: Outbox,
}

impl Client {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: CommandDecoder::new(),
            outbox: Outbox::default(),
        }
    }
}
