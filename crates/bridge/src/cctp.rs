//! CCTP v2 contract bindings and call builders.

use std::mem::size_of;

use alloy::primitives::{Address, FixedBytes, U256};
use alloy::sol;
use godshand_evm::Call;

use crate::AttestationMessage;

sol! {
    #[derive(Debug)]
    interface TokenMessengerV2 {
        function depositForBurn(
            uint256 amount,
            uint32 destinationDomain,
            bytes32 mintRecipient,
            address burnToken,
            bytes32 destinationCaller,
            uint256 maxFee,
            uint32 minFinalityThreshold
        ) external;
    }

    #[derive(Debug)]
    interface MessageTransmitterV2 {
        function receiveMessage(bytes calldata message, bytes calldata attestation)
            external
            returns (bool success);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message too short for nonce extraction: got {length} bytes, need at least 44")]
    MessageTooShort { length: usize },
}

/// Burn parameters for `depositForBurn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositForBurn {
    pub token_messenger: Address,
    pub burn_token: Address,
    pub amount: U256,
    pub destination_domain: u32,
    pub recipient: Address,
    pub max_fee: U256,
    pub min_finality_threshold: u32,
}

/// `depositForBurn` call with the recipient left-padded to 32 bytes and
/// no destination caller restriction.
pub fn deposit_for_burn(params: &DepositForBurn) -> Call {
    Call::contract(
        params.token_messenger,
        &TokenMessengerV2::depositForBurnCall {
            amount: params.amount,
            destinationDomain: params.destination_domain,
            mintRecipient: FixedBytes::<32>::left_padding_from(params.recipient.as_slice()),
            burnToken: params.burn_token,
            destinationCaller: FixedBytes::ZERO,
            maxFee: params.max_fee,
            minFinalityThreshold: params.min_finality_threshold,
        },
    )
}

/// `receiveMessage` call minting the attested burn.
pub fn receive_message(message_transmitter: Address, attested: &AttestationMessage) -> Call {
    Call::contract(
        message_transmitter,
        &MessageTransmitterV2::receiveMessageCall {
            message: attested.message.clone(),
            attestation: attested.attestation.clone(),
        },
    )
}

// CCTP V2 message layout:
// - Bytes 0-3: version
// - Bytes 4-7: source domain
// - Bytes 8-11: destination domain
// - Bytes 12-43: nonce
// - Bytes 44+: remaining message data
const NONCE_INDEX: usize = 12;
const NONCE_SIZE: usize = size_of::<FixedBytes<32>>();
const MIN_MESSAGE_LENGTH: usize = NONCE_INDEX + NONCE_SIZE;

/// Extracts the 32-byte nonce from an attested CCTP V2 message.
///
/// The `MessageSent` event of a V2 burn carries a zero placeholder; only
/// the message returned by Iris holds the assigned nonce.
pub fn extract_nonce_from_message(message: &[u8]) -> Result<FixedBytes<32>, MessageError> {
    if message.len() < MIN_MESSAGE_LENGTH {
        return Err(MessageError::MessageTooShort {
            length: message.len(),
        });
    }

    Ok(FixedBytes::<32>::from_slice(
        &message[NONCE_INDEX..MIN_MESSAGE_LENGTH],
    ))
}
