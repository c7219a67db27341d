use tokio::sync::watch;

/// Fires a shutdown signal observed by every [`Shutdown`] subscribed to it.
///
/// The server owns one trigger for all of its sessions and the accept loop, and every session
/// owns another one used to disconnect it on its own.
#[derive(Debug)]
pub(crate) struct Trigger {
    notify: watch::Sender<bool>,
}

impl Trigger {
    pub(crate) fn new() -> Trigger {
        let (notify, _) = watch::channel(false);
        Trigger { notify }
    }

    /// Sets the signal. Returns `false` when it was already set, leaving it untouched.
    pub(crate) fn fire(&self) -> bool {
        self.notify.send_if_modified(|fired| {
            if *fired {
                return false;
            }
            *fired = true;
            true
        })
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.notify.borrow()
    }

    pub(crate) fn subscribe(&self) -> Shutdown {
        Shutdown {
            notify: self.notify.subscribe(),
        }
    }
}

/// Listens for the signal of a [`Trigger`].
///
/// Sessions poll [`Shutdown::is_shutdown`] once per loop iteration. The accept loop awaits
/// [`Shutdown::recv`] next to `accept` so closing the server does not wait for a new client.
#[derive(Debug, Clone)]
pub(crate) struct Shutdown {
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    pub(crate) fn is_shutdown(&self) -> bool {
        *self.notify.borrow()
    }

    /// Waits until the signal is set. A dropped trigger counts as set.
    pub(crate) async fn recv(&mut self) {
        let _ = self.notify.wait_for(|fired| *fired).await;
    }
}
