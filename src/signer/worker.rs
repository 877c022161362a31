//! The token worker runtime.
//!
//! Every token is owned by exactly one worker running on its own thread.
//! Commands reach it through an unbounded channel and are executed one at
//! a time, in the order they were sent. The device session, cached private
//! keys and the use of the PIN never leave the worker.
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use log::{debug, error, trace};
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};

use crate::commons::error::Error;
use crate::signer::algorithm::SignAlgorithm;
use crate::signer::directory::TokenDirectory;
use crate::signer::model::Key;
use crate::signer::soft::SoftTokenWorker;

#[cfg(feature = "hsm")]
use crate::signer::hsm::HsmTokenWorker;

//------------ Command -------------------------------------------------------

pub type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// A change to the Token Directory that must run on the owning worker.
pub type DirectoryOp = Box<dyn FnOnce(&TokenDirectory) -> Result<(), Error> + Send>;

pub enum Command {
    Refresh(Reply<()>),
    Activate {
        pin: Option<SecretString>,
        reply: Reply<()>,
    },
    Deactivate(Reply<()>),
    InitializeSoftwareToken {
        pin: SecretString,
        reply: Reply<()>,
    },
    UpdateSoftwareTokenPin {
        old: SecretString,
        new: SecretString,
        reply: Reply<()>,
    },
    GenerateKey {
        label: Option<String>,
        reply: Reply<Key>,
    },
    DeleteKey {
        key_id: String,
        reply: Reply<()>,
    },
    Sign {
        key_id: String,
        algorithm: SignAlgorithm,
        digest: Bytes,
        reply: Reply<Bytes>,
    },
    Apply {
        op: DirectoryOp,
        reply: Reply<()>,
    },
    Stop,
}

//------------ TokenWorker ---------------------------------------------------

/// Dispatches commands to the implementation for the kind of token.
pub enum TokenWorker {
    Software(SoftTokenWorker),

    #[cfg(feature = "hsm")]
    Hardware(HsmTokenWorker),
}

impl TokenWorker {
    pub fn token_id(&self) -> &str {
        match self {
            TokenWorker::Software(worker) => worker.token_id(),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.token_id(),
        }
    }

    fn directory(&self) -> &TokenDirectory {
        match self {
            TokenWorker::Software(worker) => worker.directory(),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.directory(),
        }
    }

    fn start(&mut self) {
        match self {
            TokenWorker::Software(_) => {}
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.start(),
        }
    }

    fn refresh(&mut self) -> Result<(), Error> {
        match self {
            TokenWorker::Software(worker) => worker.refresh(),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.refresh(),
        }
    }

    fn activate(&mut self, pin: Option<SecretString>) -> Result<(), Error> {
        match self {
            TokenWorker::Software(worker) => worker.activate(pin),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.activate(pin),
        }
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        match self {
            TokenWorker::Software(worker) => worker.deactivate(),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.deactivate(),
        }
    }

    fn initialize(&mut self, pin: SecretString) -> Result<(), Error> {
        match self {
            TokenWorker::Software(worker) => worker.initialize(pin),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => Err(Error::invalid(format!(
                "token '{}' is not the software token",
                worker.token_id()
            ))),
        }
    }

    fn update_pin(&mut self, old: SecretString, new: SecretString) -> Result<(), Error> {
        match self {
            TokenWorker::Software(worker) => worker.update_pin(old, new),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => Err(Error::invalid(format!(
                "token '{}' is not the software token",
                worker.token_id()
            ))),
        }
    }

    fn generate_key(&mut self, label: Option<String>) -> Result<Key, Error> {
        match self {
            TokenWorker::Software(worker) => worker.generate_key(label),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.generate_key(label),
        }
    }

    fn delete_key(&mut self, key_id: &str) -> Result<(), Error> {
        match self {
            TokenWorker::Software(worker) => worker.delete_key(key_id),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.delete_key(key_id),
        }
    }

    fn sign(&mut self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]) -> Result<Bytes, Error> {
        match self {
            TokenWorker::Software(worker) => worker.sign(key_id, algorithm, digest),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.sign(key_id, algorithm, digest),
        }
    }

    fn apply(&mut self, op: DirectoryOp) -> Result<(), Error> {
        let directory = self.directory();
        op(directory)?;
        directory.persist()
    }

    fn close(&mut self) {
        match self {
            TokenWorker::Software(worker) => worker.close(),
            #[cfg(feature = "hsm")]
            TokenWorker::Hardware(worker) => worker.close(),
        }
    }

    /// Executes one command. Returns false once the worker must stop.
    fn handle(&mut self, command: Command) -> bool {
        // A dropped receiver means the caller gave up waiting, there is
        // nobody left to tell.
        match command {
            Command::Refresh(reply) => {
                let _ = reply.send(self.refresh());
            }
            Command::Activate { pin, reply } => {
                let _ = reply.send(self.activate(pin));
            }
            Command::Deactivate(reply) => {
                let _ = reply.send(self.deactivate());
            }
            Command::InitializeSoftwareToken { pin, reply } => {
                let _ = reply.send(self.initialize(pin));
            }
            Command::UpdateSoftwareTokenPin { old, new, reply } => {
                let _ = reply.send(self.update_pin(old, new));
            }
            Command::GenerateKey { label, reply } => {
                let _ = reply.send(self.generate_key(label));
            }
            Command::DeleteKey { key_id, reply } => {
                let _ = reply.send(self.delete_key(&key_id));
            }
            Command::Sign {
                key_id,
                algorithm,
                digest,
                reply,
            } => {
                let _ = reply.send(self.sign(&key_id, algorithm, &digest));
            }
            Command::Apply { op, reply } => {
                let _ = reply.send(self.apply(op));
            }
            Command::Stop => return false,
        }
        true
    }

    fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let token_id = self.token_id().to_string();
        debug!("[{}] Token worker started", token_id);
        self.start();
        while let Some(command) = receiver.blocking_recv() {
            if !self.handle(command) {
                break;
            }
        }
        self.close();
        debug!("[{}] Token worker stopped", token_id);
    }
}

//------------ WorkerClient --------------------------------------------------

/// Sends commands to a token worker and waits for the outcome.
#[derive(Clone, Debug)]
pub struct WorkerClient {
    token_id: Arc<str>,
    module: Option<Arc<str>>,
    sender: mpsc::UnboundedSender<Command>,
}

impl WorkerClient {
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// The name of the hardware module of the token, if any.
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .map_err(|_| Error::TokenNotAvailable(self.token_id.to_string()))?;
        rx.await.map_err(|_| {
            Error::internal(format!(
                "worker of token '{}' stopped before replying",
                self.token_id
            ))
        })?
    }

    pub async fn refresh(&self) -> Result<(), Error> {
        self.request(Command::Refresh).await
    }

    pub async fn activate(&self, pin: Option<SecretString>) -> Result<(), Error> {
        self.request(|reply| Command::Activate { pin, reply }).await
    }

    pub async fn deactivate(&self) -> Result<(), Error> {
        self.request(Command::Deactivate).await
    }

    pub async fn initialize_software_token(&self, pin: SecretString) -> Result<(), Error> {
        self.request(|reply| Command::InitializeSoftwareToken { pin, reply })
            .await
    }

    pub async fn update_software_token_pin(
        &self,
        old: SecretString,
        new: SecretString,
    ) -> Result<(), Error> {
        self.request(|reply| Command::UpdateSoftwareTokenPin { old, new, reply })
            .await
    }

    pub async fn generate_key(&self, label: Option<String>) -> Result<Key, Error> {
        self.request(|reply| Command::GenerateKey { label, reply })
            .await
    }

    pub async fn delete_key(&self, key_id: &str) -> Result<(), Error> {
        let key_id = key_id.to_string();
        self.request(|reply| Command::DeleteKey { key_id, reply })
            .await
    }

    pub async fn sign(
        &self,
        key_id: &str,
        algorithm: SignAlgorithm,
        digest: Bytes,
    ) -> Result<Bytes, Error> {
        let key_id = key_id.to_string();
        self.request(|reply| Command::Sign {
            key_id,
            algorithm,
            digest,
            reply,
        })
        .await
    }

    /// Runs a directory change on the worker and persists the directory.
    pub async fn apply<F>(&self, op: F) -> Result<(), Error>
    where
        F: FnOnce(&TokenDirectory) -> Result<(), Error> + Send + 'static,
    {
        self.request(|reply| Command::Apply {
            op: Box::new(op),
            reply,
        })
        .await
    }
}

//------------ WorkerHandle --------------------------------------------------

/// Owns a running token worker.
#[derive(Debug)]
pub struct WorkerHandle {
    client: WorkerClient,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Starts the worker on its own thread.
    pub fn spawn(worker: TokenWorker, module: Option<&str>) -> Result<Self, Error> {
        let token_id: Arc<str> = Arc::from(worker.token_id());
        let (sender, receiver) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name(format!("token-{}", token_id))
            .spawn(move || worker.run(receiver))
            .map_err(|e| Error::io(format!("cannot start worker for token '{}'", token_id), e))?;

        trace!("[{}] Spawned token worker", token_id);

        Ok(WorkerHandle {
            client: WorkerClient {
                token_id,
                module: module.map(Arc::from),
                sender,
            },
            thread,
        })
    }

    pub fn client(&self) -> WorkerClient {
        self.client.clone()
    }

    pub fn token_id(&self) -> &str {
        self.client.token_id()
    }

    pub fn module(&self) -> Option<&str> {
        self.client.module()
    }

    /// Stops the worker after it finished the commands sent before, and
    /// waits for its thread to end.
    pub async fn stop(self) {
        let token_id = self.client.token_id.clone();
        let _ = self.client.sender.send(Command::Stop);
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => trace!("[{}] Joined token worker", token_id),
            Ok(Err(_)) => error!("[{}] Token worker panicked", token_id),
            Err(e) => error!("[{}] Cannot join token worker: {}", token_id, e),
        }
    }
}
