//! One socket, its channels and the task client, wired together.

use crate::config::ClientConfig;
use crate::tasks::{Credentials, TaskClient};
use crate::ws::{ChannelError, Channels, Socket};

#[derive(Clone)]
pub struct RobeClient {
    socket: Socket,
    channels: Channels,
    tasks: TaskClient,
}

impl RobeClient {
    /// Build the client and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &ClientConfig) -> Result<Self, ChannelError> {
        let socket = Socket::new(config.url.as_str(), config.reconnect.clone());
        let channels = Channels::new(&socket);
        let tasks = TaskClient::new(&channels, config.retry.clone())?;

        socket.on_give_up(|reason| tracing::error!("Server unreachable: {}", reason));
        socket.start();

        Ok(Self {
            socket,
            channels,
            tasks,
        })
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.tasks.set_credentials(Some(credentials));
        self
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn tasks(&self) -> &TaskClient {
        &self.tasks
    }

    /// Stop the socket for good.
    pub fn close(&self) {
        self.socket.close();
    }
}
