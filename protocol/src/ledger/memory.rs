use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Commitment, LedgerError, LedgerOracle, TxId};

/// A write accepted by [`MemoryLedger`]
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTx {
    pub id: TxId,
    pub sender: String,
    pub nonce: u64,
    pub call: LedgerCall,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCall {
    SubmitUpdate { round: u64, hash: String },
    StartNewRound { round: u64 },
    ValidateAndPay { round: u64, participant: String, amount: u128 },
}

#[derive(Default)]
struct Book {
    training_active: bool,
    current_round: u64,
    contributions: HashMap<(u64, String), Commitment>,
    nonces: HashMap<String, u64>,
    transactions: Vec<LedgerTx>,
    reward: u128,
    failing_round_starts: u32,
    failing_reads: u32,
}

impl Book {
    fn record(&mut self, sender: &str, call: LedgerCall) -> TxId {
        let nonce = self.nonces.entry(sender.to_string()).or_insert(0);
        let tx = LedgerTx {
            id: format!("0x{:064x}", self.transactions.len() + 1),
            sender: sender.to_string(),
            nonce: *nonce,
            call,
        };
        *nonce += 1;
        let id = tx.id.clone();
        self.transactions.push(tx);
        id
    }

    fn read_fault(&mut self) -> Result<(), LedgerError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(LedgerError::Rpc("injected read failure".into()));
        }
        Ok(())
    }
}

/// In-process ledger with the contract's rules.
///
/// Clones share one book; [`as_account`](Self::as_account) gives a handle that
/// signs as another sender.
#[derive(Clone)]
pub struct MemoryLedger {
    book: Arc<Mutex<Book>>,
    account: String,
}

impl MemoryLedger {
    pub fn new(account: &str) -> Self {
        Self::at_round(0, account)
    }

    /// Ledger whose last started round is `round`; the next start returns `round + 1`.
    pub fn at_round(round: u64, account: &str) -> Self {
        let book = Book {
            current_round: round,
            reward: super::LedgerConfig::default().reward_wei,
            ..Default::default()
        };
        Self {
            book: Arc::new(Mutex::new(book)),
            account: normalize(account),
        }
    }

    pub fn as_account(&self, account: &str) -> Self {
        Self {
            book: self.book.clone(),
            account: normalize(account),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// The next `n` round starts fail with an RPC error.
    pub fn fail_round_starts(&self, n: u32) {
        self.lock().failing_round_starts = n;
    }

    /// The next `n` view calls fail with an RPC error.
    pub fn fail_reads(&self, n: u32) {
        self.lock().failing_reads = n;
    }

    pub fn set_training_active(&self, active: bool) {
        self.lock().training_active = active;
    }

    pub fn transactions(&self) -> Vec<LedgerTx> {
        self.lock().transactions.clone()
    }

    pub fn payments_to(&self, participant: &str) -> usize {
        let participant = normalize(participant);
        self.lock()
            .transactions
            .iter()
            .filter(|tx| matches!(&tx.call, LedgerCall::ValidateAndPay { participant: p, .. } if *p == participant))
            .count()
    }

    pub fn round_starts(&self) -> usize {
        self.lock()
            .transactions
            .iter()
            .filter(|tx| matches!(tx.call, LedgerCall::StartNewRound { .. }))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(account: &str) -> String {
    account.to_ascii_lowercase()
}

#[async_trait]
impl LedgerOracle for MemoryLedger {
    async fn is_training_active(&self) -> Result<bool, LedgerError> {
        let mut book = self.lock();
        book.read_fault()?;
        Ok(book.training_active)
    }

    async fn current_round(&self) -> Result<u64, LedgerError> {
        let mut book = self.lock();
        book.read_fault()?;
        Ok(book.current_round)
    }

    async fn get_contribution(&self, round: u64, participant: &str) -> Result<Commitment, LedgerError> {
        let mut book = self.lock();
        book.read_fault()?;
        Ok(book
            .contributions
            .get(&(round, normalize(participant)))
            .cloned()
            .unwrap_or_else(Commitment::empty))
    }

    async fn submit_update(&self, hash: &str) -> Result<TxId, LedgerError> {
        let mut book = self.lock();
        if !book.training_active {
            return Err(LedgerError::Rejected("training is not active".into()));
        }
        let candidate = Commitment { hash: hash.to_string(), validated: false, paid: false };
        if !candidate.is_committed() {
            return Err(LedgerError::InvalidInput("cannot commit the zero hash".into()));
        }
        let round = book.current_round;
        let key = (round, self.account.clone());
        if book.contributions.get(&key).is_some_and(Commitment::is_committed) {
            return Err(LedgerError::Rejected(format!("hash already committed for round {round}")));
        }
        book.contributions.insert(key, candidate);
        Ok(book.record(&self.account, LedgerCall::SubmitUpdate { round, hash: hash.to_string() }))
    }

    async fn start_new_round(&self) -> Result<u64, LedgerError> {
        let mut book = self.lock();
        if book.failing_round_starts > 0 {
            book.failing_round_starts -= 1;
            return Err(LedgerError::Unconfirmed("injected round-start failure".into()));
        }
        book.current_round += 1;
        book.training_active = true;
        let round = book.current_round;
        book.record(&self.account, LedgerCall::StartNewRound { round });
        Ok(round)
    }

    async fn validate_and_pay(&self, participant: &str) -> Result<TxId, LedgerError> {
        let mut book = self.lock();
        let round = book.current_round;
        let participant = normalize(participant);
        let amount = book.reward;
        let entry = book
            .contributions
            .get_mut(&(round, participant.clone()))
            .filter(|c| c.is_committed())
            .ok_or_else(|| LedgerError::Rejected(format!("no commitment for round {round}")))?;
        if entry.paid {
            return Err(LedgerError::Rejected("contribution already paid".into()));
        }
        entry.validated = true;
        entry.paid = true;
        let sender = self.account.clone();
        Ok(book.record(&sender, LedgerCall::ValidateAndPay { round, participant, amount }))
    }
}
