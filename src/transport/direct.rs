//! Direct provider adapter: provider-native JSON streaming over HTTP.

use std::sync::Arc;

use async_trait::async_trait;

use super::sse::{spawn_sse_stream, PcmHandler};
use super::{ChunkStream, RequestShaper, Transport, TransportError, TransportKind};
use crate::api::ChatRequest;
use crate::core::message::Message;
use crate::core::receiver::EventReceiver;
use crate::core::tools::ToolSchemaRegistry;
use crate::utils::url::construct_api_url;

pub struct DirectTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    shaper: Option<RequestShaper>,
    schemas: Arc<ToolSchemaRegistry>,
    on_pcm: Option<PcmHandler>,
}

impl DirectTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            shaper: None,
            schemas: Arc::new(ToolSchemaRegistry::new()),
            on_pcm: None,
        }
    }

    pub fn with_shaper(mut self, shaper: RequestShaper) -> Self {
        self.shaper = Some(shaper);
        self
    }

    pub fn with_schemas(mut self, schemas: Arc<ToolSchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_pcm_handler(mut self, handler: PcmHandler) -> Self {
        self.on_pcm = Some(handler);
        self
    }

    fn build_receiver(&self) -> EventReceiver {
        let mut receiver = EventReceiver::with_schemas(self.schemas.clone());
        if let Some(handler) = self.on_pcm.clone() {
            receiver.on_pcm(move |bytes| handler(bytes));
        }
        receiver
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send_messages(&self, messages: &[Message]) -> Result<ChunkStream, TransportError> {
        let url = construct_api_url(&self.base_url, "chat/completions");
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: true,
        };

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if let Some(shaper) = &self.shaper {
            builder = shaper(builder);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(TransportError::Http { status, body });
        }

        Ok(spawn_sse_stream(response, self.build_receiver()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }
}
