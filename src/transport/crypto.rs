//! 会话加密模块
//!
//! 握手阶段用 X25519 临时密钥协商共享密钥，之后每帧用
//! XChaCha20-Poly1305 加密。每个会话独立密钥，会话结束即销毁。
//!
//! ## Nonce 派生
//!
//! 使用 BLAKE3 `derive_key` 模式从 `(发送方公钥, 帧计数器)` 确定性派生
//! 24 字节 nonce。TCP 保证帧有序，两端计数器天然同步，无需在线协商。

use chacha20poly1305::aead::{Aead, OsRng};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::{VerifyError, VerifyResult};

const KEY_CONTEXT: &str = "neartrust-session-key-v1";
const NONCE_CONTEXT: &str = "neartrust-frame-nonce-v1";

/// 本端握手密钥对（每个会话一对，用完即弃）
pub(crate) struct Handshake {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Handshake {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// 用对方公钥完成协商，返回（封帧器, 开帧器）
    pub fn complete(self, peer_public: [u8; 32]) -> (FrameSealer, FrameOpener) {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        let key = blake3::derive_key(KEY_CONTEXT, shared.as_bytes());
        let cipher = XChaCha20Poly1305::new((&key).into());
        (
            FrameSealer {
                cipher: cipher.clone(),
                key_id: self.public.to_bytes(),
                counter: 0,
            },
            FrameOpener {
                cipher,
                key_id: peer_public,
                counter: 0,
            },
        )
    }
}

/// 发送方向的帧加密器
pub(crate) struct FrameSealer {
    cipher: XChaCha20Poly1305,
    /// 本端公钥，做 nonce 域分离（两个方向 nonce 永不碰撞）
    key_id: [u8; 32],
    counter: u64,
}

impl FrameSealer {
    /// 加密一帧，输出 = 密文 + 16 字节 Poly1305 认证标签
    pub fn seal(&mut self, plaintext: &[u8]) -> VerifyResult<Vec<u8>> {
        let nonce = derive_nonce(&self.key_id, self.counter);
        self.counter += 1;
        self.cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| VerifyError::Unknown("frame encryption failed".into()))
    }
}

/// 接收方向的帧解密器
pub(crate) struct FrameOpener {
    cipher: XChaCha20Poly1305,
    /// 对端公钥
    key_id: [u8; 32],
    counter: u64,
}

impl FrameOpener {
    /// 解密一帧；认证标签校验失败（数据被篡改或计数器失序）时报错
    pub fn open(&mut self, ciphertext: &[u8]) -> VerifyResult<Vec<u8>> {
        let nonce = derive_nonce(&self.key_id, self.counter);
        self.counter += 1;
        self.cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext)
            .map_err(|_| VerifyError::Unknown("frame authentication failed".into()))
    }
}

/// 从 `(发送方公钥, 帧计数器)` 派生 24 字节 nonce
fn derive_nonce(key_id: &[u8; 32], counter: u64) -> [u8; 24] {
    let mut input = [0u8; 40];
    input[..32].copy_from_slice(key_id);
    input[32..].copy_from_slice(&counter.to_be_bytes());

    let hash = blake3::derive_key(NONCE_CONTEXT, &input);

    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&hash[..24]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> ((FrameSealer, FrameOpener), (FrameSealer, FrameOpener)) {
        let a = Handshake::generate();
        let b = Handshake::generate();
        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();
        (a.complete(b_pub), b.complete(a_pub))
    }

    #[test]
    fn seal_open_roundtrip_both_directions() {
        let ((mut a_seal, mut a_open), (mut b_seal, mut b_open)) = pair();

        let frame = b_open.open(&a_seal.seal(b"hello from a").unwrap()).unwrap();
        assert_eq!(frame, b"hello from a");

        let frame = a_open.open(&b_seal.seal(b"hello from b").unwrap()).unwrap();
        assert_eq!(frame, b"hello from b");
    }

    #[test]
    fn counters_keep_multiple_frames_in_order() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();

        for i in 0..5u8 {
            let sealed = a_seal.seal(&[i]).unwrap();
            assert_eq!(b_open.open(&sealed).unwrap(), vec![i]);
        }
    }

    #[test]
    fn tampered_frame_is_rejected() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();

        let mut sealed = a_seal.seal(b"secret").unwrap();
        sealed[0] ^= 0xff;
        assert!(b_open.open(&sealed).is_err());
    }

    #[test]
    fn skipped_frame_desyncs_the_counter() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();

        let _dropped = a_seal.seal(b"first").unwrap();
        let second = a_seal.seal(b"second").unwrap();
        // 接收端计数器还停在 0，解不开计数器为 1 的帧
        assert!(b_open.open(&second).is_err());
    }
}
