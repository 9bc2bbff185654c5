use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use ln_loop_out::error::NodeError;
use ln_loop_out::lightning::node::{
    HoldInvoiceNode, HoldInvoiceRequest, InvoiceState, InvoiceUpdates, IssuedInvoice,
};
use ln_loop_out::swap::secret::{PaymentHash, Preimage};
use tokio::sync::mpsc;

/// Signs a regtest BOLT11 invoice committing to `payment_hash` and `amount_msat`.
pub fn bolt11(payment_hash: PaymentHash, amount_msat: u64, cltv_expiry: u64) -> String {
    let secp = Secp256k1::new();
    let node_key = SecretKey::from_slice(&[0x42; 32]).expect("node key");

    InvoiceBuilder::new(Currency::Regtest)
        .description("loop out".to_string())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash.to_byte_array()))
        .payment_secret(PaymentSecret([7u8; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(cltv_expiry)
        .amount_milli_satoshis(amount_msat)
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, &node_key))
        .expect("sign invoice")
        .to_string()
}

/// In-memory hold-invoice node. Tests play the payer through [`FakeNode::pay`].
#[derive(Clone, Default)]
pub struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

#[derive(Default)]
struct NodeState {
    invoices: HashMap<PaymentHash, InvoiceState>,
    subscribers: Vec<(PaymentHash, mpsc::Sender<Result<InvoiceState, NodeError>>)>,
    requests: Vec<HoldInvoiceRequest>,
    settled: Vec<Preimage>,
    canceled: Vec<PaymentHash>,
    create_rejection: Option<String>,
    invoice_amount_msat: Option<u64>,
}

impl FakeNode {
    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().expect("node state poisoned")
    }

    fn set_state(&self, payment_hash: PaymentHash, new_state: InvoiceState) {
        let mut state = self.lock();
        state.invoices.insert(payment_hash, new_state);
        state.subscribers.retain(|(hash, tx)| {
            *hash != payment_hash || tx.try_send(Ok(new_state)).is_ok()
        });
    }

    /// The payer locks in its HTLC.
    pub fn pay(&self, payment_hash: PaymentHash) {
        self.set_state(payment_hash, InvoiceState::Accepted);
    }

    pub fn expire(&self, payment_hash: PaymentHash) {
        self.set_state(payment_hash, InvoiceState::Canceled);
    }

    /// Ends every open subscription without a final state.
    pub fn close_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    pub fn reject_create(&self, reason: &str) {
        self.lock().create_rejection = Some(reason.to_string());
    }

    /// Makes issued payment requests carry a different amount than requested.
    pub fn misreport_amount_msat(&self, amount_msat: u64) {
        self.lock().invoice_amount_msat = Some(amount_msat);
    }

    pub fn invoice_state(&self, payment_hash: PaymentHash) -> Option<InvoiceState> {
        self.lock().invoices.get(&payment_hash).copied()
    }

    pub fn requests(&self) -> Vec<HoldInvoiceRequest> {
        self.lock().requests.clone()
    }

    pub fn settled(&self) -> Vec<Preimage> {
        self.lock().settled.clone()
    }

    pub fn canceled(&self) -> Vec<PaymentHash> {
        self.lock().canceled.clone()
    }
}

#[tonic::async_trait]
impl HoldInvoiceNode for FakeNode {
    async fn create_hold_invoice(
        &self,
        request: HoldInvoiceRequest,
    ) -> Result<IssuedInvoice, NodeError> {
        let mut state = self.lock();
        if let Some(reason) = &state.create_rejection {
            return Err(NodeError::Rejected(reason.clone()));
        }
        if state.invoices.contains_key(&request.payment_hash) {
            return Err(NodeError::Rejected("invoice with payment hash already exists".to_string()));
        }

        let amount_msat = state.invoice_amount_msat.unwrap_or(request.amount_msat);
        let payment_request = bolt11(request.payment_hash, amount_msat, request.cltv_expiry);
        state.invoices.insert(request.payment_hash, InvoiceState::Open);
        state.requests.push(request.clone());

        Ok(IssuedInvoice {
            payment_request,
            payment_hash: request.payment_hash,
            amount_msat: request.amount_msat,
            cltv_expiry: request.cltv_expiry,
        })
    }

    async fn subscribe_invoice(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<InvoiceUpdates, NodeError> {
        let mut state = self.lock();
        let current = *state
            .invoices
            .get(&payment_hash)
            .ok_or_else(|| NodeError::Rejected("unable to locate invoice".to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tx.try_send(Ok(current))
            .map_err(|e| NodeError::Rejected(format!("subscription buffer: {e}")))?;
        state.subscribers.push((payment_hash, tx));
        Ok(rx)
    }

    async fn settle_invoice(&self, preimage: Preimage) -> Result<(), NodeError> {
        let payment_hash = preimage.payment_hash();
        match self.invoice_state(payment_hash) {
            Some(InvoiceState::Accepted) => {}
            Some(other) => {
                return Err(NodeError::Rejected(format!("invoice is {other:?}, not accepted")));
            }
            None => return Err(NodeError::Rejected("unable to locate invoice".to_string())),
        }

        self.set_state(payment_hash, InvoiceState::Settled);
        self.lock().settled.push(preimage);
        Ok(())
    }

    async fn cancel_invoice(&self, payment_hash: PaymentHash) -> Result<(), NodeError> {
        match self.invoice_state(payment_hash) {
            Some(InvoiceState::Settled) => {
                return Err(NodeError::Rejected("invoice already settled".to_string()));
            }
            Some(_) => {}
            None => return Err(NodeError::Rejected("unable to locate invoice".to_string())),
        }

        self.set_state(payment_hash, InvoiceState::Canceled);
        self.lock().canceled.push(payment_hash);
        Ok(())
    }
}
