use crate::crypto::{
    encode, encode_then_seal_asym, encode_then_seal_sym, open_then_decode_sym, CryptoError, SymKey,
};
use crate::protocol::{
    CircuitPackage, HttpTunnelRequest, LayerRequest, NextHop, OnionMessage, RelayReply, RingRouter,
    SealKind,
};
use veilnet_common::{ClientId, TraceToken};

/// Errors while wrapping or unwrapping onions
#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A hop answered with `did_succeed = false`
    #[error("{0}")]
    Relay(String),

    #[error("Malformed reply onion: {0}")]
    Malformed(&'static str),
}

/// Build the three `Init` packages that construct a circuit.
///
/// Package `i` carries hop `i`'s key grant, asym-sealed to that hop's public
/// key, wrapped in one sym layer per hop already holding a key. All three
/// are sent to the guard; the established prefix of the circuit relays each
/// grant inward.
pub fn circuit_init_packages(
    client_id: &ClientId,
    ring: &[RingRouter],
    keys: &[SymKey],
) -> Result<Vec<CircuitPackage>, OnionError> {
    let mut packages = Vec::with_capacity(ring.len());

    for i in 0..ring.len() {
        let grant = LayerRequest {
            client_id: client_id.clone(),
            next: None,
            payload: keys[i].as_bytes().to_vec(),
        };

        let mut sealed = encode_then_seal_asym(&ring[i].public_key, &grant)?;
        let mut seal = SealKind::Asym;

        // Wrap outward through the hops that will relay the grant
        for j in (0..i).rev() {
            let layer = LayerRequest {
                client_id: client_id.clone(),
                next: Some(NextHop {
                    addr: ring[j + 1].addr.clone(),
                    seal,
                }),
                payload: sealed,
            };
            sealed = encode_then_seal_sym(&keys[j], &layer)?;
            seal = SealKind::Sym;
        }

        packages.push(CircuitPackage {
            client_id: client_id.clone(),
            payload: sealed,
            seal,
            token: TraceToken::generate(),
        });
    }

    Ok(packages)
}

/// Wrap an HTTP tunnel request into a three-layer onion for the guard
pub fn onionize_request(
    client_id: &ClientId,
    request: &HttpTunnelRequest,
    ring: &[RingRouter],
    keys: &[SymKey],
) -> Result<OnionMessage, OnionError> {
    let innermost = LayerRequest {
        client_id: client_id.clone(),
        next: None,
        payload: encode(request)?,
    };

    let last = ring.len() - 1;
    let mut onion = encode_then_seal_sym(&keys[last], &innermost)?;

    for j in (0..last).rev() {
        let layer = LayerRequest {
            client_id: client_id.clone(),
            next: Some(NextHop {
                addr: ring[j + 1].addr.clone(),
                seal: SealKind::Sym,
            }),
            payload: onion,
        };
        onion = encode_then_seal_sym(&keys[j], &layer)?;
    }

    Ok(OnionMessage {
        client_id: client_id.clone(),
        onion,
        token: TraceToken::generate(),
    })
}

/// The teardown envelope: the init nesting with no key grant and an empty
/// innermost payload
pub fn teardown_package(
    client_id: &ClientId,
    ring: &[RingRouter],
    keys: &[SymKey],
) -> Result<CircuitPackage, OnionError> {
    let innermost = LayerRequest {
        client_id: client_id.clone(),
        next: None,
        payload: Vec::new(),
    };

    let last = ring.len() - 1;
    let mut sealed = encode_then_seal_sym(&keys[last], &innermost)?;

    for j in (0..last).rev() {
        let layer = LayerRequest {
            client_id: client_id.clone(),
            next: Some(NextHop {
                addr: ring[j + 1].addr.clone(),
                seal: SealKind::Sym,
            }),
            payload: sealed,
        };
        sealed = encode_then_seal_sym(&keys[j], &layer)?;
    }

    Ok(CircuitPackage {
        client_id: client_id.clone(),
        payload: sealed,
        seal: SealKind::Sym,
        token: TraceToken::generate(),
    })
}

/// Unwrap a response onion with the circuit keys in guard-to-exit order.
///
/// Each depth holds a `RelayReply`: a failure aborts with the hop's message,
/// the web-server reply yields the body, anything else recurses.
pub fn deonionize_response(onion: &[u8], keys: &[SymKey]) -> Result<Vec<u8>, OnionError> {
    let mut onion = onion.to_vec();

    for key in keys {
        let reply: RelayReply = open_then_decode_sym(key, &onion)?;

        if !reply.did_succeed {
            return Err(OnionError::Relay(
                reply.err_msg.unwrap_or_else(|| "relay failed".to_string()),
            ));
        }
        if reply.is_web_server {
            return reply
                .payload
                .ok_or(OnionError::Malformed("web server reply without a body"));
        }
        onion = reply
            .payload
            .ok_or(OnionError::Malformed("relay reply without a payload"))?;
    }

    Err(OnionError::Malformed("no web server reply at full depth"))
}

/// Unwrap a layered acknowledgement (init or teardown replies).
///
/// Success is a `None` payload before the keys run out; a failure at any
/// depth aborts with that hop's message.
pub fn unwrap_acks(sealed: &[u8], keys: &[SymKey]) -> Result<(), OnionError> {
    let mut sealed = sealed.to_vec();

    for key in keys {
        let reply: RelayReply = open_then_decode_sym(key, &sealed)?;

        if !reply.did_succeed {
            return Err(OnionError::Relay(
                reply.err_msg.unwrap_or_else(|| "relay failed".to_string()),
            ));
        }
        match reply.payload {
            Some(inner) => sealed = inner,
            None => return Ok(()),
        }
    }

    Err(OnionError::Malformed("acknowledgement nested past the circuit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decode, open_asym, RsaKeyPair};
    use veilnet_common::RouterId;

    struct TestRing {
        ring: Vec<RingRouter>,
        pairs: Vec<RsaKeyPair>,
        keys: Vec<SymKey>,
        client_id: ClientId,
    }

    fn test_ring() -> TestRing {
        let pairs: Vec<RsaKeyPair> = (0..3).map(|_| RsaKeyPair::generate().unwrap()).collect();
        let ring = pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| RingRouter {
                router_id: RouterId::new(i as u32 + 1),
                public_key: pair.public_der().to_vec(),
                addr: format!("127.0.0.1:62{:02}", i),
            })
            .collect();

        TestRing {
            ring,
            pairs,
            keys: (0..3).map(|_| SymKey::generate()).collect(),
            client_id: ClientId::new("onion-test"),
        }
    }

    /// Peel one sym layer the way a router would
    fn peel(key: &SymKey, onion: &[u8]) -> LayerRequest {
        open_then_decode_sym(key, onion).unwrap()
    }

    #[test]
    fn test_forward_onion_peels_to_the_request() {
        let t = test_ring();
        let request = HttpTunnelRequest::get("http://example/view/");

        let message = onionize_request(&t.client_id, &request, &t.ring, &t.keys).unwrap();

        // Guard peel: addressed onward to the middle
        let layer0 = peel(&t.keys[0], &message.onion);
        assert_eq!(layer0.next.as_ref().unwrap().addr, t.ring[1].addr);

        // Middle peel: addressed onward to the exit
        let layer1 = peel(&t.keys[1], &layer0.payload);
        assert_eq!(layer1.next.as_ref().unwrap().addr, t.ring[2].addr);

        // Exit peel: the plaintext encoding of the request, nothing further
        let layer2 = peel(&t.keys[2], &layer1.payload);
        assert_eq!(layer2.next, None);
        assert_eq!(layer2.payload, encode(&request).unwrap());
    }

    #[test]
    fn test_response_unwraps_to_body_at_depth_three() {
        let t = test_ring();
        let body = b"<html>deep</html>".to_vec();

        // Wrap the way exit, middle, guard would on the return path
        let sealed_exit =
            encode_then_seal_sym(&t.keys[2], &RelayReply::web_server(body.clone())).unwrap();
        let sealed_middle =
            encode_then_seal_sym(&t.keys[1], &RelayReply::ok(Some(sealed_exit))).unwrap();
        let sealed_guard =
            encode_then_seal_sym(&t.keys[0], &RelayReply::ok(Some(sealed_middle))).unwrap();

        assert_eq!(deonionize_response(&sealed_guard, &t.keys).unwrap(), body);
    }

    #[test]
    fn test_response_failure_surfaces_the_hop_message() {
        let t = test_ring();

        let sealed_middle = encode_then_seal_sym(
            &t.keys[1],
            &RelayReply::failed("Unable to contact next router."),
        )
        .unwrap();
        let sealed_guard =
            encode_then_seal_sym(&t.keys[0], &RelayReply::ok(Some(sealed_middle))).unwrap();

        let err = deonionize_response(&sealed_guard, &t.keys).unwrap_err();
        assert!(matches!(err, OnionError::Relay(msg) if msg == "Unable to contact next router."));
    }

    #[test]
    fn test_init_package_shapes() {
        let t = test_ring();
        let packages = circuit_init_packages(&t.client_id, &t.ring, &t.keys).unwrap();
        assert_eq!(packages.len(), 3);

        // First grant goes straight to the guard's public key
        assert_eq!(packages[0].seal, SealKind::Asym);
        let grant0: LayerRequest = decode(
            &open_asym(t.pairs[0].private_key(), &packages[0].payload).unwrap(),
        )
        .unwrap();
        assert_eq!(grant0.payload, t.keys[0].as_bytes().to_vec());
        assert_eq!(grant0.next, None);

        // Third grant peels through both established hops before the exit
        assert_eq!(packages[2].seal, SealKind::Sym);
        let layer0 = peel(&t.keys[0], &packages[2].payload);
        let hop1 = layer0.next.unwrap();
        assert_eq!(hop1.addr, t.ring[1].addr);
        assert_eq!(hop1.seal, SealKind::Sym);

        let layer1 = peel(&t.keys[1], &layer0.payload);
        let hop2 = layer1.next.unwrap();
        assert_eq!(hop2.addr, t.ring[2].addr);
        assert_eq!(hop2.seal, SealKind::Asym);

        let grant2: LayerRequest =
            decode(&open_asym(t.pairs[2].private_key(), &layer1.payload).unwrap()).unwrap();
        assert_eq!(grant2.payload, t.keys[2].as_bytes().to_vec());
    }

    #[test]
    fn test_teardown_package_reaches_every_hop() {
        let t = test_ring();
        let package = teardown_package(&t.client_id, &t.ring, &t.keys).unwrap();
        assert_eq!(package.seal, SealKind::Sym);

        let layer0 = peel(&t.keys[0], &package.payload);
        assert_eq!(layer0.next.as_ref().unwrap().addr, t.ring[1].addr);

        let layer1 = peel(&t.keys[1], &layer0.payload);
        assert_eq!(layer1.next.as_ref().unwrap().addr, t.ring[2].addr);

        let layer2 = peel(&t.keys[2], &layer1.payload);
        assert_eq!(layer2.next, None);
        assert!(layer2.payload.is_empty());
    }

    #[test]
    fn test_acks_unwrap_to_success() {
        let t = test_ring();

        // Exit teardown answers with no payload; each hop outward wraps it
        let sealed_middle = encode_then_seal_sym(&t.keys[1], &RelayReply::ok(None)).unwrap();
        let sealed_guard =
            encode_then_seal_sym(&t.keys[0], &RelayReply::ok(Some(sealed_middle))).unwrap();

        unwrap_acks(&sealed_guard, &t.keys).unwrap();
    }

    #[test]
    fn test_acks_surface_failures() {
        let t = test_ring();

        let sealed_guard = encode_then_seal_sym(
            &t.keys[0],
            &RelayReply::failed("Unable to send to next router."),
        )
        .unwrap();

        let err = unwrap_acks(&sealed_guard, &t.keys).unwrap_err();
        assert!(matches!(err, OnionError::Relay(msg) if msg == "Unable to send to next router."));
    }

    #[test]
    fn test_wrong_key_order_misdecrypts() {
        let t = test_ring();
        let request = HttpTunnelRequest::get("http://example/");
        let message = onionize_request(&t.client_id, &request, &t.ring, &t.keys).unwrap();

        // Peeling with the exit key first cannot produce a valid layer
        assert!(open_then_decode_sym::<LayerRequest>(&t.keys[2], &message.onion).is_err());
    }
}
