//! What a client does: create channel streams and write messages to them.

use streamlog_rs::{
    snapshot::make_genesis_miniblock,
    types::{
        crypto_primitives::Wallet,
        data_types::{MiniblockRef, StreamId, StreamType},
        envelope::{make_parsed_event, Envelope},
        miniblock::MiniblockInfo,
        payloads::{ChannelInception, ChannelPayload, EncryptedData, Payload, StreamSettings},
    },
};

/// The genesis miniblock of a new channel.
pub(crate) fn channel_genesis(wallet: &Wallet) -> MiniblockInfo {
    let inception = make_parsed_event(
        wallet,
        Payload::Channel(ChannelPayload::Inception(ChannelInception {
            stream_id: StreamId::random(StreamType::Channel),
            space_id: StreamId::random(StreamType::Space),
            settings: StreamSettings::default(),
        })),
        None,
    )
    .unwrap();
    make_genesis_miniblock(wallet, vec![inception], true).unwrap()
}

/// A signed message event referencing `prev`, the last miniblock the client has seen.
pub(crate) fn message(wallet: &Wallet, prev: MiniblockRef, text: &str) -> Envelope {
    let payload = Payload::Channel(ChannelPayload::Message(EncryptedData { ciphertext: text.to_string(), ..Default::default() }));
    make_parsed_event(wallet, payload, Some(prev)).unwrap().envelope
}
