use crate::Result;

use std::pin::Pin;

use eyre::WrapErr;
use futures::stream::{select_all, Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;

/// Signals the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    Child,
    Hup,
    Term,
    Int,
    Usr1,
    Usr2,
    Power,
}

impl Sig {
    fn kind(self) -> SignalKind {
        match self {
            Sig::Child => SignalKind::child(),
            Sig::Hup => SignalKind::hangup(),
            Sig::Term => SignalKind::terminate(),
            Sig::Int => SignalKind::interrupt(),
            Sig::Usr1 => SignalKind::user_defined1(),
            Sig::Usr2 => SignalKind::user_defined2(),
            Sig::Power => SignalKind::from_raw(libc::SIGPWR),
        }
    }
}

const SIGNALS: [Sig; 7] = [
    Sig::Child,
    Sig::Hup,
    Sig::Term,
    Sig::Int,
    Sig::Usr1,
    Sig::Usr2,
    Sig::Power,
];

/// Merged stream over every handled signal, reporting which one fired.
/// Failure to install a handler is fatal for an init process.
pub struct Signals {
    stream: Pin<Box<dyn Stream<Item = Sig>>>,
}

impl Signals {
    pub fn new() -> Result<Self> {
        let mut streams = Vec::with_capacity(SIGNALS.len());
        for sig in SIGNALS {
            let st = signal(sig.kind())
                .wrap_err_with(|| format!("cannot install handler for {:?}", sig))?;
            streams.push(SignalStream::new(st).map(move |_| sig).boxed_local());
        }

        Ok(Signals {
            stream: Box::pin(select_all(streams)),
        })
    }

    pub async fn next(&mut self) -> Option<Sig> {
        self.stream.next().await
    }
}
