use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;
use tonic::codegen::InterceptedService;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Status};

use crate::error::NodeError;
use crate::lightning::node::{
    HoldInvoiceNode, HoldInvoiceRequest, InvoiceState, InvoiceUpdates, IssuedInvoice,
};
use crate::proto::invoicesrpc::invoice::InvoiceState as WireInvoiceState;
use crate::proto::invoicesrpc::invoices_client::InvoicesClient;
use crate::proto::invoicesrpc::{
    AddHoldInvoiceRequest, CancelInvoiceMsg, SettleInvoiceMsg, SubscribeSingleInvoiceRequest,
};
use crate::swap::secret::{PaymentHash, Preimage};

const UPDATE_BUFFER: usize = 16;

/// Attaches the hex-encoded LND macaroon to every request.
#[derive(Clone)]
pub struct MacaroonInterceptor {
    macaroon: Option<MetadataValue<Ascii>>,
}

impl MacaroonInterceptor {
    pub fn new(macaroon: Option<&[u8]>) -> Result<Self> {
        let macaroon = macaroon
            .map(|bytes| hex::encode(bytes).parse::<MetadataValue<Ascii>>())
            .transpose()
            .context("encode macaroon metadata")?;
        Ok(Self { macaroon })
    }
}

impl Interceptor for MacaroonInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        if let Some(macaroon) = &self.macaroon {
            request.metadata_mut().insert("macaroon", macaroon.clone());
        }
        Ok(request)
    }
}

/// [`HoldInvoiceNode`] backed by LND's `invoicesrpc.Invoices` gRPC service.
#[derive(Clone)]
pub struct LndInvoicesClient {
    client: InvoicesClient<InterceptedService<Channel, MacaroonInterceptor>>,
}

impl LndInvoicesClient {
    /// `tls_cert_path` pins LND's self-signed certificate and requires an
    /// `https://` url.
    pub async fn connect(
        grpc_url: &str,
        tls_cert_path: Option<&Path>,
        macaroon_path: Option<&Path>,
    ) -> Result<Self> {
        let mut endpoint = Endpoint::from_shared(grpc_url.to_string())
            .with_context(|| format!("parse lnd grpc url {grpc_url}"))?
            .connect_timeout(Duration::from_secs(10));

        if let Some(path) = tls_cert_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("read lnd tls certificate {}", path.display()))?;
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))
                .context("configure lnd tls")?;
        }

        let macaroon = macaroon_path
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("read lnd macaroon {}", path.display()))
            })
            .transpose()?;

        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("connect to lnd at {grpc_url}"))?;

        Self::from_channel(channel, macaroon.as_deref())
    }

    pub fn from_channel(channel: Channel, macaroon: Option<&[u8]>) -> Result<Self> {
        let interceptor = MacaroonInterceptor::new(macaroon)?;
        Ok(Self {
            client: InvoicesClient::with_interceptor(channel, interceptor),
        })
    }
}

fn status_error(call: &'static str, status: Status) -> NodeError {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Cancelled
        | Code::ResourceExhausted
        | Code::Aborted => NodeError::Unavailable(
            anyhow::anyhow!("{} ({:?})", status.message(), status.code()).context(call),
        ),
        _ => NodeError::Rejected(format!("{call}: {}", status.message())),
    }
}

fn wire_state(state: i32) -> Result<InvoiceState, NodeError> {
    match WireInvoiceState::try_from(state) {
        Ok(WireInvoiceState::Open) => Ok(InvoiceState::Open),
        Ok(WireInvoiceState::Accepted) => Ok(InvoiceState::Accepted),
        Ok(WireInvoiceState::Settled) => Ok(InvoiceState::Settled),
        Ok(WireInvoiceState::Canceled) => Ok(InvoiceState::Canceled),
        Err(_) => Err(NodeError::Rejected(format!("unknown invoice state {state}"))),
    }
}

#[tonic::async_trait]
impl HoldInvoiceNode for LndInvoicesClient {
    async fn create_hold_invoice(
        &self,
        request: HoldInvoiceRequest,
    ) -> Result<IssuedInvoice, NodeError> {
        let value_msat = i64::try_from(request.amount_msat).map_err(|_| {
            NodeError::Rejected(format!("amount {} msat out of range", request.amount_msat))
        })?;

        let resp = self
            .client
            .clone()
            .add_hold_invoice(AddHoldInvoiceRequest {
                memo: request.memo,
                hash: request.payment_hash.to_byte_array().to_vec(),
                value: 0,
                value_msat,
                expiry: 0,
                cltv_expiry: request.cltv_expiry,
            })
            .await
            .map_err(|s| status_error("AddHoldInvoice", s))?
            .into_inner();

        tracing::debug!(add_index = resp.add_index, "lnd added hold invoice");

        Ok(IssuedInvoice {
            payment_request: resp.payment_request,
            payment_hash: request.payment_hash,
            amount_msat: request.amount_msat,
            cltv_expiry: request.cltv_expiry,
        })
    }

    async fn subscribe_invoice(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<InvoiceUpdates, NodeError> {
        let mut stream = self
            .client
            .clone()
            .subscribe_single_invoice(SubscribeSingleInvoiceRequest {
                r_hash: payment_hash.to_byte_array().to_vec(),
            })
            .await
            .map_err(|s| status_error("SubscribeSingleInvoice", s))?
            .into_inner();

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        tokio::spawn(async move {
            loop {
                let update = match stream.message().await {
                    Ok(Some(invoice)) => wire_state(invoice.state),
                    Ok(None) => break,
                    Err(status) => Err(status_error("SubscribeSingleInvoice", status)),
                };
                let failed = update.is_err();
                if tx.send(update).await.is_err() || failed {
                    break;
                }
            }
            tracing::debug!(%payment_hash, "invoice subscription ended");
        });

        Ok(rx)
    }

    async fn settle_invoice(&self, preimage: Preimage) -> Result<(), NodeError> {
        self.client
            .clone()
            .settle_invoice(SettleInvoiceMsg {
                preimage: preimage.to_byte_array().to_vec(),
            })
            .await
            .map_err(|s| status_error("SettleInvoice", s))?;
        Ok(())
    }

    async fn cancel_invoice(&self, payment_hash: PaymentHash) -> Result<(), NodeError> {
        self.client
            .clone()
            .cancel_invoice(CancelInvoiceMsg {
                payment_hash: payment_hash.to_byte_array().to_vec(),
            })
            .await
            .map_err(|s| status_error("CancelInvoice", s))?;
        Ok(())
    }
}
