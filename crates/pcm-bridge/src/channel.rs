//! In-process method channel between a host and the [`FeedPlugin`].
//!
//! Calls are serialized onto one command thread (`pcm-commands`), so the plugin only ever
//! runs on one context. Engine events are turned into outbound [`MethodCall`]s by a
//! forwarder thread (`pcm-events`); the host drains them from [`MethodChannel::callbacks`]
//! wherever it wants them delivered.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};
use pcm_player::config::FeederConfig;
use pcm_player::sink::SinkFactory;
use pcm_types::{FeederEvent, MethodCall, MethodResponse};

use crate::plugin::FeedPlugin;

struct Request {
    call: MethodCall,
    reply: Sender<MethodResponse>,
}

/// Handle to a running plugin. Dropping it releases the plugin and joins both threads.
pub struct MethodChannel {
    cmd_tx: Option<Sender<Request>>,
    callbacks: Receiver<MethodCall>,
    commands: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl MethodChannel {
    /// Start a plugin whose sessions open sinks from `factory`.
    pub fn spawn(factory: Arc<dyn SinkFactory>, config: FeederConfig) -> Result<Self> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<FeederEvent>();
        let (callback_tx, callback_rx) = crossbeam_channel::unbounded::<MethodCall>();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<Request>();

        let forwarder = std::thread::Builder::new()
            .name("pcm-events".to_string())
            .spawn(move || {
                for event in event_rx {
                    if callback_tx.send(event.into_call()).is_err() {
                        break;
                    }
                }
            })
            .context("spawn event forwarder")?;

        let plugin = FeedPlugin::new(factory, config, event_tx);
        let commands = std::thread::Builder::new()
            .name("pcm-commands".to_string())
            .spawn(move || command_thread_main(plugin, cmd_rx))
            .context("spawn command thread")?;

        Ok(Self {
            cmd_tx: Some(cmd_tx),
            callbacks: callback_rx,
            commands: Some(commands),
            forwarder: Some(forwarder),
        })
    }

    /// Send a call and wait for its reply.
    pub fn invoke(&self, call: MethodCall) -> Result<MethodResponse> {
        let cmd_tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| anyhow!("method channel closed"))?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let method = call.method.clone();
        cmd_tx
            .send(Request {
                call,
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("command thread exited"))?;
        reply_rx
            .recv()
            .with_context(|| format!("no reply to {method}"))
    }

    /// Calls the plugin makes back to the host (`OnFeedSamples`, `OnPlaybackFault`).
    pub fn callbacks(&self) -> &Receiver<MethodCall> {
        &self.callbacks
    }
}

impl Drop for MethodChannel {
    fn drop(&mut self) {
        self.cmd_tx.take();
        if let Some(handle) = self.commands.take() {
            if handle.join().is_err() {
                tracing::warn!("command thread panicked");
            }
        }
        if let Some(handle) = self.forwarder.take() {
            let _ = handle.join();
        }
    }
}

fn command_thread_main(mut plugin: FeedPlugin, cmd_rx: Receiver<Request>) {
    while let Ok(request) = cmd_rx.recv() {
        let response = plugin.handle(&request.call);
        let _ = request.reply.send(response);
    }
    tracing::debug!("method channel closed; releasing plugin");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcm_player::memory::{MemorySinkFactory, MemorySinkProbe};
    use pcm_types::{ON_FEED_SAMPLES, ON_PLAYBACK_FAULT};
    use serde_json::json;
    use std::time::Duration;

    fn channel() -> (MethodChannel, MemorySinkProbe) {
        let factory = MemorySinkFactory::default();
        let probe = factory.probe();
        let channel = MethodChannel::spawn(Arc::new(factory), FeederConfig::default()).unwrap();
        (channel, probe)
    }

    fn next_callback(channel: &MethodChannel) -> MethodCall {
        channel
            .callbacks()
            .recv_timeout(Duration::from_secs(5))
            .expect("callback")
    }

    #[test]
    fn round_trip_and_feed_notifications() {
        let (channel, probe) = channel();
        let setup = MethodCall::new("setup", json!({ "sample_rate": 16000, "num_channels": 1 }));
        assert!(channel.invoke(setup).unwrap().is_success());

        let first = next_callback(&channel);
        assert_eq!(first.method, ON_FEED_SAMPLES);
        assert_eq!(first.arguments["remaining_frames"], 0);

        let feed = MethodCall::new("feed", json!({ "buffer": vec![7u8; 400] }));
        assert!(channel.invoke(feed).unwrap().is_success());
        assert!(probe.wait_for_bytes(400, Duration::from_secs(5)));

        loop {
            let call = next_callback(&channel);
            assert_eq!(call.method, ON_FEED_SAMPLES);
            if call.arguments["remaining_frames"] == 0 {
                break;
            }
        }
    }

    #[test]
    fn unknown_call_round_trips_as_not_implemented() {
        let (channel, _probe) = channel();
        let response = channel.invoke(MethodCall::bare("nope")).unwrap();
        assert_eq!(response, MethodResponse::NotImplemented);
    }

    #[test]
    fn dropping_channel_releases_plugin() {
        let (channel, probe) = channel();
        let setup = MethodCall::new("setup", json!({ "sample_rate": 8000, "num_channels": 2 }));
        channel.invoke(setup).unwrap();
        drop(channel);
        assert!(probe.is_released(1));
    }

    #[test]
    fn fault_is_forwarded_as_callback() {
        let factory = MemorySinkFactory::new(pcm_player::memory::MemorySinkOptions {
            fail_write_after: Some(0),
            ..Default::default()
        });
        let channel = MethodChannel::spawn(Arc::new(factory), FeederConfig::default()).unwrap();
        channel
            .invoke(MethodCall::new("setup", json!({ "sample_rate": 16000, "num_channels": 1 })))
            .unwrap();
        channel
            .invoke(MethodCall::new("feed", json!({ "buffer": [0, 0, 0, 0] })))
            .unwrap();

        let fault = loop {
            let call = next_callback(&channel);
            if call.method == ON_PLAYBACK_FAULT {
                break call;
            }
        };
        assert!(fault.arguments["message"].as_str().unwrap().contains("scripted"));
    }
}
