//! Wire codec for protocol envelopes.

use ordo_core::errors::{OrdoError, Result};

use crate::messages::Envelope;

/// Encode an envelope for transport.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    bincode::serialize(envelope).map_err(|err| OrdoError::serialization(err.to_string()))
}

/// Decode an envelope received from transport.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    bincode::deserialize(bytes).map_err(|err| OrdoError::serialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        AgreementMessage, CoordinateReply, Payload, RequestId, TokenAssignment,
    };
    use ordo_core::token::{NodeId, PartitionId, Token};
    use proptest::prelude::*;

    fn round_trip(token: Token) -> Token {
        let envelope = Envelope::correlated(
            NodeId(1),
            RequestId::fresh(),
            Payload::CoordinateReply(CoordinateReply::Assigned(TokenAssignment::Single(token))),
        );
        let bytes = encode_envelope(&envelope).expect("encode");
        let decoded = decode_envelope(&bytes).expect("decode");
        match decoded.payload {
            Payload::CoordinateReply(CoordinateReply::Assigned(TokenAssignment::Single(token))) => {
                token
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn token_without_concurrentno_round_trips() {
        let token = Token::unbatched(42).with_partition(PartitionId(7));
        assert_eq!(round_trip(token.clone()), token);
    }

    #[test]
    fn token_with_concurrentno_round_trips() {
        let token = Token::closing(42, 3).with_partition(PartitionId(7));
        assert_eq!(round_trip(token.clone()), token);
    }

    #[test]
    fn token_with_session_round_trips() {
        let token = Token::member(9).with_session("sess-1");
        assert_eq!(round_trip(token.clone()), token);
    }

    #[test]
    fn token_without_session_round_trips() {
        let token = Token::unbatched(0);
        assert_eq!(round_trip(token.clone()), token);
    }

    #[test]
    fn agreement_round_trips() {
        let envelope = Envelope::new(
            NodeId(3),
            Payload::Agreement(AgreementMessage {
                partitions: vec![PartitionId(1)],
                skips: vec![Token::unbatched(4).with_partition(PartitionId(1))],
                triggers_retransmission: true,
                view_id: Some(12),
            }),
        );
        let bytes = encode_envelope(&envelope).expect("encode");
        assert_eq!(decode_envelope(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_envelope(&[0xff; 3]).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_tokens_round_trip(
            seqno in -1000..1000i32,
            concurrentno in proptest::option::of(-1..64i32),
            session in proptest::option::of("[a-z]{1,12}"),
        ) {
            let mut token = Token::new(seqno, concurrentno);
            if let Some(session) = session {
                token = token.with_session(session);
            }
            prop_assert_eq!(round_trip(token.clone()), token);
        }
    }
}
