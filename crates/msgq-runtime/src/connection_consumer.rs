//! Connection consumers: broker push delivery fanned out to a pool of
//! application-server sessions.
//!
//! Each delivered message is acknowledged as soon as it arrives, queued on a
//! server session drawn from the pool and run on the delivering task. There
//! is no parallelism across messages of one connection consumer.

use crate::connection::Connection;
use crate::consumer::{MessageConsumer, MessageListener};
use crate::destination::Destination;
use crate::error::MessagingError;
use crate::message::Message;
use crate::provider::AckMode;
use crate::session::{Session, SessionInner};
use crate::sync::lock;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

#[cfg(test)]
#[path = "connection_consumer_tests.rs"]
mod tests;

/// A session together with the means to run it
#[async_trait]
pub trait ServerSession: Send + Sync {
    fn session(&self) -> &Session;

    /// Run the session's queued messages through its session listener
    async fn start(&self) -> Result<(), MessagingError>;
}

/// Supplies server sessions to connection consumers
#[async_trait]
pub trait ServerSessionPool: Send + Sync {
    async fn server_session(&self) -> Result<Arc<dyn ServerSession>, MessagingError>;
}

/// Server session that runs its session inline
pub struct SimpleServerSession {
    session: Session,
}

impl SimpleServerSession {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ServerSession for SimpleServerSession {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn start(&self) -> Result<(), MessagingError> {
        self.session.run().await;
        Ok(())
    }
}

/// Hands out a fixed set of server sessions round-robin
pub struct SimpleServerSessionPool {
    sessions: Vec<Arc<dyn ServerSession>>,
    next: AtomicUsize,
}

impl SimpleServerSessionPool {
    pub fn new(sessions: Vec<Arc<dyn ServerSession>>) -> Result<Self, MessagingError> {
        if sessions.is_empty() {
            return Err(MessagingError::invalid_state(
                "a server session pool needs at least one session",
            ));
        }
        Ok(Self {
            sessions,
            next: AtomicUsize::new(0),
        })
    }

    /// Wrap each session in a [`SimpleServerSession`]
    pub fn from_sessions(sessions: Vec<Session>) -> Result<Self, MessagingError> {
        Self::new(
            sessions
                .into_iter()
                .map(|s| Arc::new(SimpleServerSession::new(s)) as Arc<dyn ServerSession>)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl ServerSessionPool for SimpleServerSessionPool {
    async fn server_session(&self) -> Result<Arc<dyn ServerSession>, MessagingError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        Ok(self.sessions[index].clone())
    }
}

/// Listener on the internal session that feeds the pool
struct Bridge {
    session: Weak<SessionInner>,
    pool: Arc<dyn ServerSessionPool>,
}

#[async_trait]
impl MessageListener for Bridge {
    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };

        let server = self.pool.server_session().await?;
        session.acknowledge_now(&message).await?;
        debug!(
            session_id = %session.id(),
            target_session_id = %server.session().id(),
            message_id = ?message.message_id,
            "Bridging message to server session"
        );
        server.session().inner().enqueue(message);
        server.start().await?;
        Ok(())
    }
}

/// Delivers a destination's messages to sessions drawn from a pool
pub struct ConnectionConsumer {
    session: Session,
    consumer: MessageConsumer,
    pool: Arc<dyn ServerSessionPool>,
    closed: Mutex<bool>,
}

impl ConnectionConsumer {
    pub(crate) async fn open(
        connection: &Connection,
        destination: &Destination,
        subscription_name: Option<&str>,
        selector: Option<&str>,
        pool: Arc<dyn ServerSessionPool>,
    ) -> Result<Self, MessagingError> {
        let session = connection.create_session(false, AckMode::Client).await?;

        let consumer = match subscription_name {
            Some(name) => {
                session
                    .create_durable_subscriber(destination, name, selector, false)
                    .await
            }
            None => session.create_consumer(destination, selector, false).await,
        };
        let consumer = match consumer {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };

        let bridge = Arc::new(Bridge {
            session: Arc::downgrade(session.inner()),
            pool: pool.clone(),
        });
        if let Err(e) = consumer.set_message_listener(Some(bridge)).await {
            let _ = session.close().await;
            return Err(e);
        }

        info!(
            connection_id = %connection.id(),
            session_id = %session.id(),
            destination = %destination,
            "Connection consumer created"
        );
        Ok(Self {
            session,
            consumer,
            pool,
            closed: Mutex::new(false),
        })
    }

    pub fn destination(&self) -> &Destination {
        self.consumer.destination()
    }

    pub fn selector(&self) -> Option<&str> {
        self.consumer.selector()
    }

    pub fn server_session_pool(&self) -> &Arc<dyn ServerSessionPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    /// Stop feeding the pool; pooled sessions are left open
    pub async fn close(&self) -> Result<(), MessagingError> {
        {
            let mut closed = lock(&self.closed);
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        self.session.close().await
    }
}
