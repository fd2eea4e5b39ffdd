use std::collections::HashMap;
use std::sync::Arc;

use palaver_channels::{
    ApiAdapter, ChannelAdapter, FacebookAdapter, SlackAdapter, TelegramAdapter, WebAdapter,
    WhatsappAdapter,
};
use palaver_core::ChannelGateway;
use palaver_schema::{ChannelPlatform, ChannelTransport, Experiment, ExperimentChannel, InboundMessage};

/// Read-only lookup tables for the configured experiments and channels.
pub struct Registry {
    experiments: HashMap<String, Experiment>,
    channels: HashMap<String, ExperimentChannel>,
}

impl Registry {
    pub fn new(experiments: Vec<Experiment>, channels: Vec<ExperimentChannel>) -> Self {
        Self {
            experiments: experiments.into_iter().map(|e| (e.id.clone(), e)).collect(),
            channels: channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn experiment(&self, id: &str) -> Option<&Experiment> {
        self.experiments.get(id)
    }

    /// Channel plus its experiment, by channel id.
    pub fn pair(&self, channel_id: &str) -> Option<(&Experiment, &ExperimentChannel)> {
        let channel = self.channels.get(channel_id)?;
        let experiment = self.experiments.get(&channel.experiment_id)?;
        Some((experiment, channel))
    }

    /// WhatsApp channels are addressed by the business number the message
    /// was sent to.
    pub fn whatsapp_by_number(&self, to: &str) -> Option<(&Experiment, &ExperimentChannel)> {
        self.channels.values().find_map(|channel| match &channel.transport {
            ChannelTransport::Whatsapp { number, .. } if number == to => {
                Some((self.experiments.get(&channel.experiment_id)?, channel))
            }
            _ => None,
        })
    }

    /// Facebook channels are addressed by the receiving page id.
    pub fn facebook_by_page(&self, page_id: &str) -> Option<(&Experiment, &ExperimentChannel)> {
        self.channels.values().find_map(|channel| match &channel.transport {
            ChannelTransport::Facebook { page_id: id, .. } if id == page_id => {
                Some((self.experiments.get(&channel.experiment_id)?, channel))
            }
            _ => None,
        })
    }

    pub fn facebook_verify_token(&self, token: &str) -> bool {
        self.channels.values().any(|channel| {
            matches!(&channel.transport, ChannelTransport::Facebook { verify_token, .. }
                if verify_token == token)
        })
    }

    pub fn channel_for_platform(
        &self,
        experiment_id: &str,
        platform: ChannelPlatform,
    ) -> Option<(&Experiment, &ExperimentChannel)> {
        self.channels.values().find_map(|channel| {
            (channel.experiment_id == experiment_id && channel.platform() == platform)
                .then(|| Some((self.experiments.get(&channel.experiment_id)?, channel)))
                .flatten()
        })
    }
}

/// Build the outbound adapter matching a channel's transport.
pub fn adapter_for(
    channel: &ExperimentChannel,
    message: &InboundMessage,
) -> Box<dyn ChannelAdapter> {
    match &channel.transport {
        ChannelTransport::Web => Box::new(WebAdapter),
        ChannelTransport::Api => Box::new(ApiAdapter),
        ChannelTransport::Telegram { bot_token } => Box::new(TelegramAdapter::new(bot_token)),
        ChannelTransport::Whatsapp {
            number,
            account_sid,
            auth_token,
        } => Box::new(WhatsappAdapter::new(number, account_sid, auth_token)),
        ChannelTransport::Facebook {
            page_id,
            page_access_token,
            ..
        } => Box::new(FacebookAdapter::new(page_id, page_access_token)),
        ChannelTransport::Slack { bot_token } => {
            Box::new(SlackAdapter::for_message(bot_token, message))
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChannelGateway>,
    pub registry: Arc<Registry>,
}
