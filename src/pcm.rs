//! PCM変換と転送用エンコーディング
//!
//! マイクの浮動小数点サンプルを16ビット整数へ変換し、リトルエンディアンの
//! バイト列をbase64で文字列化する。受信側はその逆を行う。

use crate::types::SampleI16;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// 浮動小数点サンプル (-1.0〜1.0) を16ビット整数に変換
///
/// `sample * 32768` を整数化する。範囲外の値は `as` キャストにより
/// i16 の最小値・最大値に飽和する（ラップアラウンドはしない）。
pub fn float_to_i16(samples: &[f32]) -> Vec<SampleI16> {
    samples.iter().map(|&s| (s * 32768.0) as i16).collect()
}

/// 16ビット整数サンプルを浮動小数点に変換 (`/ 32768.0`)
pub fn i16_to_float(samples: &[SampleI16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// サンプル列をリトルエンディアンのバイト列に変換
pub fn i16_to_le_bytes(samples: &[SampleI16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// リトルエンディアンのバイト列をサンプル列に変換
///
/// 奇数長の場合、末尾の1バイトは捨てる。
pub fn le_bytes_to_i16(bytes: &[u8]) -> Vec<SampleI16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// バイト列をbase64文字列にエンコード
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// base64文字列をバイト列にデコード
pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// キャプチャブロックを送信用ペイロードに変換
///
/// float → i16 → LEバイト列 → base64
pub fn encode_capture_block(samples: &[f32]) -> String {
    encode(&i16_to_le_bytes(&float_to_i16(samples)))
}

/// 受信ペイロードを再生用の浮動小数点サンプルに変換
///
/// base64 → LEバイト列 → i16 → float
pub fn decode_playback_chunk(data: &str) -> Result<Vec<f32>, base64::DecodeError> {
    let bytes = decode(data)?;
    Ok(i16_to_float(&le_bytes_to_i16(&bytes)))
}
