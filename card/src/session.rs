//! Command dispatch and the applet-wide lifecycle.
//!
//! Every command is checked against the current [`DeviceState`] and the
//! authentication flag before its parameters are even looked at. Handlers
//! validate fully before mutating; the few multi-step handlers commit state
//! only after every fallible step has succeeded.

use crate::apdu::{Command, Opcode, Response};
use crate::app_state::{DeviceContext, DeviceState};
use crate::codec::MessageType;
use crate::crypto::{CryptoOps, HASH_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::errors::{CardError, CardResult};
use crate::ledger::RECORD_LEN;

const AUTH_CHALLENGE_DOMAIN: &[u8] = b"zereans.auth.challenge.v1";
const AUTH_RESPONSE_DOMAIN: &[u8] = b"zereans.auth.response.v1";

pub const CHALLENGE_LEN: usize = 32;
pub const AUTH_NONCE_LEN: usize = 32;
pub const VERIFY_DATA_LEN: usize = 32;

pub const KEY_SELECTOR_AUTHORITY: u8 = 0x00;
pub const KEY_SELECTOR_IDENTITY: u8 = 0x01;

/// Message the authority signs to open a session.
pub fn challenge_message(challenge: &[u8]) -> Vec<u8> {
    [AUTH_CHALLENGE_DOMAIN, challenge].concat()
}

/// Message the device signs in answer to a challenge.
pub fn auth_response_message(challenge_hash: &[u8; HASH_LEN], nonce: &[u8]) -> Vec<u8> {
    [AUTH_RESPONSE_DOMAIN, challenge_hash.as_slice(), nonce].concat()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStateMachine;

impl SessionStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Parse and run one raw command APDU.
    pub fn process(&self, ctx: &mut DeviceContext, apdu: &[u8]) -> Response {
        match Command::parse(apdu) {
            Ok(command) => self.dispatch(ctx, &command),
            Err(err) => {
                log::warn!("Malformed command rejected: {}", err);
                Response::fault(&err)
            }
        }
    }

    pub fn dispatch(&self, ctx: &mut DeviceContext, command: &Command) -> Response {
        let result = self.handle_command(ctx, command);
        if let Err(err) = &result {
            log::warn!(
                "Command {:#04x} refused in {:?}: {} (fault {:?})",
                command.ins,
                ctx.state,
                err,
                err.fault_code()
            );
        }
        Response::from(result)
    }

    pub fn handle_command(&self, ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
        if ctx.config().require_class_zero && command.cla != 0x00 {
            return Err(CardError::ClassNotSupported(command.cla));
        }

        let opcode = command.opcode()?;
        log::debug!(
            "Dispatching {} in {:?} (authenticated={})",
            opcode,
            ctx.state,
            ctx.authenticated
        );
        check_preconditions(ctx, opcode)?;

        match opcode {
            Opcode::Initialize => initialize(ctx, command),
            Opcode::Authenticate => authenticate(ctx, command),
            Opcode::ProcessTransaction => process_transaction(ctx, command),
            Opcode::GetBalance => Ok(ctx.ledger.balance().to_be_bytes().to_vec()),
            Opcode::GetStatus => Ok(status_bytes(ctx)),
            Opcode::UpdateKeys => update_keys(ctx, command),
            Opcode::VerifySignature => verify_signature(ctx, command),
            Opcode::EstablishSession => establish_session(ctx, command),
            Opcode::EncryptData => ctx.vault.encrypt(&command.data),
            Opcode::DecryptData => {
                // Moved, not copied: the response buffer is the only plaintext left.
                let mut plaintext = ctx.vault.decrypt(&command.data)?;
                Ok(std::mem::take(&mut *plaintext))
            }
            Opcode::AddPartner => {
                let partner_id = command.expect_len(1)?[0];
                ctx.partners.add(partner_id)?;
                Ok(Vec::new())
            }
            Opcode::RemovePartner => {
                let partner_id = command.expect_len(1)?[0];
                ctx.partners.remove(partner_id)?;
                Ok(Vec::new())
            }
            Opcode::PartnerMessage => partner_message(ctx, command),
            Opcode::CloseSession => {
                command.expect_len(0)?;
                ctx.end_session();
                ctx.state = DeviceState::Initialized;
                log::info!("Session closed");
                Ok(Vec::new())
            }
        }
    }
}

fn check_preconditions(ctx: &DeviceContext, opcode: Opcode) -> CardResult<()> {
    let state = ctx.state;
    let authenticated = ctx.authenticated;

    let allowed = match opcode {
        Opcode::Initialize => state == DeviceState::Uninitialized,
        Opcode::Authenticate => state == DeviceState::Initialized,
        Opcode::ProcessTransaction => authenticated && state == DeviceState::Authenticated,
        Opcode::GetBalance => authenticated && state >= DeviceState::Initialized,
        Opcode::GetStatus => true,
        Opcode::UpdateKeys => {
            authenticated && matches!(state, DeviceState::Authenticated | DeviceState::Active)
        }
        Opcode::VerifySignature
        | Opcode::EstablishSession
        | Opcode::EncryptData
        | Opcode::DecryptData
        | Opcode::AddPartner
        | Opcode::RemovePartner
        | Opcode::PartnerMessage
        | Opcode::CloseSession => authenticated,
    };

    if allowed {
        Ok(())
    } else {
        Err(CardError::Precondition(format!(
            "{} not allowed in {:?} (authenticated={})",
            opcode, state, authenticated
        )))
    }
}

fn initialize(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    let mut authority = [0u8; PUBLIC_KEY_LEN];
    authority.copy_from_slice(command.expect_len(PUBLIC_KEY_LEN)?);
    let starting_balance = ctx.config().starting_balance;

    let provisioned = provision(ctx, &authority, starting_balance);
    if provisioned.is_err() {
        ctx.vault.erase_all();
    }
    let public_key = provisioned?;

    ctx.partners.clear();
    ctx.last_challenge = None;
    ctx.authenticated = false;
    ctx.state = DeviceState::Initialized;
    log::info!("Device initialized with balance {}", starting_balance);
    Ok(public_key.to_vec())
}

fn provision(
    ctx: &mut DeviceContext,
    authority: &[u8; PUBLIC_KEY_LEN],
    starting_balance: i16,
) -> CardResult<[u8; PUBLIC_KEY_LEN]> {
    ctx.vault.set_authority(authority)?;
    let public_key = ctx.vault.generate_identity()?;
    ctx.ledger.reset(starting_balance)?;
    Ok(public_key)
}

fn authenticate(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    let data = command.expect_len(CHALLENGE_LEN + SIGNATURE_LEN)?;
    let (challenge, signature) = data.split_at(CHALLENGE_LEN);

    let challenge_hash = CryptoOps::hash(challenge);
    if ctx.last_challenge == Some(challenge_hash) {
        return Err(CardError::AuthenticationFailed(
            "Challenge was already used".to_string(),
        ));
    }
    if !ctx
        .vault
        .verify_authority(&challenge_message(challenge), signature)?
    {
        return Err(CardError::AuthenticationFailed(
            "Challenge signature rejected".to_string(),
        ));
    }

    let nonce = CryptoOps::random_bytes::<AUTH_NONCE_LEN>()?;
    let response_signature = ctx
        .vault
        .sign(&auth_response_message(&challenge_hash, &nonce))?;

    ctx.last_challenge = Some(challenge_hash);
    ctx.authenticated = true;
    ctx.state = DeviceState::Authenticated;
    log::info!("Authority authenticated");

    let mut response = Vec::with_capacity(AUTH_NONCE_LEN + SIGNATURE_LEN);
    response.extend_from_slice(&nonce);
    response.extend_from_slice(&response_signature);
    Ok(response)
}

fn process_transaction(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    let data = command.expect_len(2 + SIGNATURE_LEN)?;
    let amount = i16::from_be_bytes([data[0], data[1]]);

    let receipt = ctx
        .ledger
        .apply_transaction(amount, &data[2..], &ctx.vault)?;
    ctx.state = DeviceState::Active;

    let response = receipt.to_bytes();
    debug_assert_eq!(response.len(), 2 + RECORD_LEN);
    Ok(response)
}

fn status_bytes(ctx: &DeviceContext) -> Vec<u8> {
    let counter = ctx.ledger.counter().to_be_bytes();
    vec![
        ctx.state.as_byte(),
        counter[0],
        counter[1],
        u8::from(ctx.authenticated),
        ctx.partners.len() as u8,
    ]
}

fn update_keys(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    command.expect_len(0)?;
    let public_key = ctx.vault.rotate()?;
    ctx.end_session();
    ctx.state = DeviceState::Initialized;
    Ok(public_key.to_vec())
}

fn verify_signature(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    let data = command.expect_len(VERIFY_DATA_LEN + SIGNATURE_LEN)?;
    let (message, signature) = data.split_at(VERIFY_DATA_LEN);

    let valid = match command.p1 {
        KEY_SELECTOR_AUTHORITY => ctx.vault.verify_authority(message, signature)?,
        KEY_SELECTOR_IDENTITY => ctx.vault.verify(message, signature)?,
        other => {
            return Err(CardError::ValidationError(format!(
                "Unknown key selector {:#04x}",
                other
            )))
        }
    };
    Ok(vec![u8::from(valid)])
}

fn establish_session(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    let mut peer_public = [0u8; PUBLIC_KEY_LEN];
    peer_public.copy_from_slice(command.expect_len(PUBLIC_KEY_LEN)?);
    let wrapped = ctx.vault.establish_session(&peer_public)?;
    log::debug!("Session key established");
    Ok(wrapped)
}

fn partner_message(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
    let (&partner_id, payload) = command.data.split_first().ok_or(CardError::WrongLength {
        expected: 1,
        actual: 0,
    })?;
    if !ctx.partners.contains(partner_id) {
        return Err(CardError::InvalidPartner(partner_id));
    }
    let message_type = MessageType::from_byte(command.p1)?;
    ctx.codec.encode(message_type, partner_id, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardConfig;
    use crate::errors::{status, FaultCode};
    use ed25519_dalek::SigningKey;

    struct Issuer {
        key: SigningKey,
    }

    impl Issuer {
        fn new() -> Self {
            Self {
                key: SigningKey::from_bytes(&[7u8; 32]),
            }
        }

        fn public(&self) -> [u8; 32] {
            self.key.verifying_key().to_bytes()
        }

        fn challenge(&self, challenge: [u8; 32]) -> Command {
            let signature = CryptoOps::sign(&self.key, &challenge_message(&challenge));
            Command::for_opcode(Opcode::Authenticate, [challenge.as_slice(), &signature].concat())
        }

        fn transaction(&self, ctx: &DeviceContext, amount: i16) -> Command {
            let payload = ctx.ledger().payload_for(amount);
            let signature = CryptoOps::sign(&self.key, &payload.signing_bytes());
            Command::for_opcode(
                Opcode::ProcessTransaction,
                [amount.to_be_bytes().as_slice(), &signature].concat(),
            )
        }
    }

    fn run(ctx: &mut DeviceContext, command: &Command) -> CardResult<Vec<u8>> {
        SessionStateMachine::new().handle_command(ctx, command)
    }

    fn authenticated_device(issuer: &Issuer) -> DeviceContext {
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();
        run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public())).unwrap();
        run(&mut ctx, &issuer.challenge([1u8; 32])).unwrap();
        ctx
    }

    #[test]
    fn initialize_provisions_keys_and_balance() {
        let issuer = Issuer::new();
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();

        let public_key = run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public())).unwrap();
        assert_eq!(public_key, ctx.vault().public_key().unwrap().to_vec());
        assert_eq!(ctx.state(), DeviceState::Initialized);
        assert_eq!(ctx.balance(), 1000);
        assert_eq!(ctx.vault().authority_public_key(), Some(issuer.public()));

        let again = run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public()));
        assert!(matches!(again, Err(CardError::Precondition(_))));
    }

    #[test]
    fn initialize_with_bad_authority_leaves_device_blank() {
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();
        let short = run(&mut ctx, &Command::for_opcode(Opcode::Initialize, vec![1u8; 31]));
        assert!(matches!(short, Err(CardError::WrongLength { .. })));
        assert_eq!(ctx.state(), DeviceState::Uninitialized);
        assert!(!ctx.vault().has_identity());
    }

    #[test]
    fn initialize_with_small_order_authority_stays_uninitialized() {
        let issuer = Issuer::new();
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();

        let weak = run(&mut ctx, &Command::for_opcode(Opcode::Initialize, [0u8; 32]));
        assert!(matches!(weak, Err(CardError::ValidationError(_))));
        assert_eq!(ctx.state(), DeviceState::Uninitialized);
        assert!(!ctx.vault().has_identity());
        assert!(ctx.vault().authority_public_key().is_none());

        run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public())).unwrap();
        assert_eq!(ctx.state(), DeviceState::Initialized);
    }

    #[test]
    fn authenticate_returns_bound_response() {
        let issuer = Issuer::new();
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();
        run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public())).unwrap();

        let challenge = [0x42u8; 32];
        let response = run(&mut ctx, &issuer.challenge(challenge)).unwrap();
        assert_eq!(response.len(), AUTH_NONCE_LEN + SIGNATURE_LEN);

        let (nonce, signature) = response.split_at(AUTH_NONCE_LEN);
        let message = auth_response_message(&CryptoOps::hash(&challenge), nonce);
        assert!(ctx.vault().verify(&message, signature).unwrap());
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.state(), DeviceState::Authenticated);
    }

    #[test]
    fn forged_challenge_is_refused() {
        let issuer = Issuer::new();
        let impostor = Issuer {
            key: SigningKey::from_bytes(&[8u8; 32]),
        };
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();
        run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public())).unwrap();

        let err = run(&mut ctx, &impostor.challenge([3u8; 32])).unwrap_err();
        assert_eq!(err.fault_code(), FaultCode::AuthenticationFailed);
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.state(), DeviceState::Initialized);
    }

    #[test]
    fn replayed_challenge_is_refused_after_close() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);
        run(&mut ctx, &Command::for_opcode(Opcode::CloseSession, Vec::new())).unwrap();
        assert_eq!(ctx.state(), DeviceState::Initialized);
        assert!(!ctx.is_authenticated());

        let err = run(&mut ctx, &issuer.challenge([1u8; 32])).unwrap_err();
        assert!(matches!(err, CardError::AuthenticationFailed(_)));
        run(&mut ctx, &issuer.challenge([2u8; 32])).unwrap();
        assert!(ctx.is_authenticated());
    }

    #[test]
    fn transaction_moves_to_active_and_locks_further_debits() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);

        let command = issuer.transaction(&ctx, 100);
        let response = run(&mut ctx, &command).unwrap();
        assert_eq!(&response[..2], &900i16.to_be_bytes());
        assert_eq!(response.len(), 2 + RECORD_LEN);
        assert_eq!(ctx.state(), DeviceState::Active);

        let second = issuer.transaction(&ctx, 50);
        let err = run(&mut ctx, &second).unwrap_err();
        assert!(matches!(err, CardError::Precondition(_)));
        assert_eq!(ctx.balance(), 900);
        assert_eq!(ctx.counter(), 1);
    }

    #[test]
    fn failed_transaction_keeps_state() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);

        let mut command = issuer.transaction(&ctx, 100);
        command.data[10] ^= 0xFF;
        let err = run(&mut ctx, &command).unwrap_err();
        assert_eq!(err.fault_code(), FaultCode::InvalidSignature);
        assert_eq!(ctx.state(), DeviceState::Authenticated);
        assert_eq!(ctx.balance(), 1000);
    }

    #[test]
    fn update_keys_rotates_and_drops_authentication() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);
        let old_key = ctx.vault().public_key().unwrap();

        let new_key = run(&mut ctx, &Command::for_opcode(Opcode::UpdateKeys, Vec::new())).unwrap();
        assert_ne!(new_key, old_key.to_vec());
        assert_eq!(ctx.state(), DeviceState::Initialized);
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.vault().authority_public_key(), Some(issuer.public()));

        let err = run(&mut ctx, &Command::for_opcode(Opcode::UpdateKeys, Vec::new())).unwrap_err();
        assert!(matches!(err, CardError::Precondition(_)));
    }

    #[test]
    fn verify_signature_selects_key() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);
        let data = [9u8; 32];

        let by_issuer = CryptoOps::sign(&issuer.key, &data);
        let mut command =
            Command::for_opcode(Opcode::VerifySignature, [data.as_slice(), &by_issuer].concat());
        assert_eq!(run(&mut ctx, &command).unwrap(), vec![1]);

        command.p1 = KEY_SELECTOR_IDENTITY;
        assert_eq!(run(&mut ctx, &command).unwrap(), vec![0]);

        let by_device = ctx.vault().sign(&data).unwrap();
        command.data = [data.as_slice(), &by_device].concat();
        assert_eq!(run(&mut ctx, &command).unwrap(), vec![1]);

        command.p1 = 0x05;
        assert!(matches!(run(&mut ctx, &command), Err(CardError::ValidationError(_))));
    }

    #[test]
    fn partner_messages_require_registration() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);

        let mut message = Command::for_opcode(Opcode::PartnerMessage, vec![5u8, 1, 2, 3]);
        message.p1 = MessageType::Transaction.as_byte();
        let err = run(&mut ctx, &message).unwrap_err();
        assert_eq!(err, CardError::InvalidPartner(5));

        run(&mut ctx, &Command::for_opcode(Opcode::AddPartner, vec![5u8])).unwrap();
        let encoded = run(&mut ctx, &message).unwrap();
        assert_eq!(encoded, vec![0x01, 0x02, 0x05, 0x00, 0x03, 1, 2, 3]);

        run(&mut ctx, &Command::for_opcode(Opcode::RemovePartner, vec![5u8])).unwrap();
        assert!(run(&mut ctx, &message).is_err());
    }

    #[test]
    fn session_key_is_single_use() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);
        let host_secret = [0x31u8; 32];
        let host_public = CryptoOps::x25519_public(&host_secret);

        let wrapped = run(&mut ctx, &Command::for_opcode(Opcode::EstablishSession, host_public)).unwrap();
        let session_key = CryptoOps::unwrap_session_key(&host_secret, &wrapped).unwrap();

        let sealed = run(&mut ctx, &Command::for_opcode(Opcode::EncryptData, b"ping".to_vec())).unwrap();
        assert!(ctx.vault().session_key_is_zeroed());
        assert_eq!(CryptoOps::open(&session_key, &sealed).unwrap().as_slice(), b"ping");

        let err = run(&mut ctx, &Command::for_opcode(Opcode::EncryptData, b"pong".to_vec())).unwrap_err();
        assert!(matches!(err, CardError::Precondition(_)));
    }

    #[test]
    fn decrypt_returns_plaintext_and_consumes_key() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);
        let host_secret = [0x44u8; 32];
        let host_public = CryptoOps::x25519_public(&host_secret);

        let wrapped = run(&mut ctx, &Command::for_opcode(Opcode::EstablishSession, host_public)).unwrap();
        let session_key = CryptoOps::unwrap_session_key(&host_secret, &wrapped).unwrap();
        let sealed = CryptoOps::seal(&session_key, b"batch 7").unwrap();

        let raw = ctx.process(&Command::for_opcode(Opcode::DecryptData, sealed).to_bytes().unwrap());
        assert_eq!(raw, [b"batch 7".as_slice(), &[0x90u8, 0x00]].concat());
        assert!(ctx.vault().session_key_is_zeroed());
    }

    #[test]
    fn class_and_instruction_checks() {
        let issuer = Issuer::new();
        let mut ctx = authenticated_device(&issuer);
        let machine = SessionStateMachine::new();

        let mut command = Command::for_opcode(Opcode::GetStatus, Vec::new());
        command.cla = 0x80;
        let response = machine.dispatch(&mut ctx, &command);
        assert_eq!(response.status, status::SW_CLA_NOT_SUPPORTED);

        let response = machine.process(&mut ctx, &[0x00, 0x7E, 0x00, 0x00]);
        assert_eq!(response.status, status::SW_INS_NOT_SUPPORTED);
        assert_eq!(response.fault_code(), Some(FaultCode::Transport));
    }

    #[test]
    fn unauthenticated_opcodes_are_refused_without_side_effects() {
        let issuer = Issuer::new();
        let mut ctx = DeviceContext::new(CardConfig::default()).unwrap();
        run(&mut ctx, &Command::for_opcode(Opcode::Initialize, issuer.public())).unwrap();

        for opcode in Opcode::ALL {
            if matches!(opcode, Opcode::Authenticate | Opcode::GetStatus) {
                continue;
            }
            let err = run(&mut ctx, &Command::for_opcode(opcode, vec![1u8])).unwrap_err();
            assert!(matches!(err, CardError::Precondition(_)), "{opcode}");
            assert_eq!(ctx.state(), DeviceState::Initialized);
            assert_eq!(ctx.balance(), 1000);
            assert_eq!(ctx.counter(), 0);
            assert!(ctx.partners().is_empty());
        }
    }
}
