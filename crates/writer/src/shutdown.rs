use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    /// First ctrl-c: drain in-flight batches, then exit.
    Graceful,
    /// Second ctrl-c: exit now.
    Immediate,
}

pub fn spawn_ctrl_c_handler(shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut signals = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            signals += 1;
            let event = if signals == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if shutdown_tx.send(event).is_err() || signals > 1 {
                return;
            }
        }
    });
}
