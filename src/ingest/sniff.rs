/// Audio container detection from leading bytes and file names
use serde::Serialize;

/// Bytes needed to recognize every supported container
pub const HEADER_LEN: usize = 16;

/// Upload extensions kept on the scratch copy; anything else becomes `bin`
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "aac", "ogg", "opus", "wma"];

const ASF_GUID: [u8; 16] = [
    0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioContainer {
    Mpeg,
    Wave,
    Flac,
    Ogg,
    Mp4,
    Asf,
    /// Header checks disabled
    Unchecked,
}

pub fn sniff(header: &[u8]) -> Option<AudioContainer> {
    if header.starts_with(b"ID3") {
        return Some(AudioContainer::Mpeg);
    }
    // MPEG/ADTS frame sync: 11 set bits
    if header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0 {
        return Some(AudioContainer::Mpeg);
    }
    if header.starts_with(b"RIFF") {
        return Some(AudioContainer::Wave);
    }
    if header.starts_with(b"fLaC") {
        return Some(AudioContainer::Flac);
    }
    if header.starts_with(b"OggS") {
        return Some(AudioContainer::Ogg);
    }
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return Some(AudioContainer::Mp4);
    }
    if header.starts_with(&ASF_GUID) {
        return Some(AudioContainer::Asf);
    }
    None
}

/// Lowercased extension of `filename` if it is a known audio extension
pub fn safe_extension(filename: Option<&str>) -> &'static str {
    let ext = filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext {
        Some(ext) => AUDIO_EXTENSIONS
            .iter()
            .copied()
            .find(|known| *known == ext)
            .unwrap_or("bin"),
        None => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_containers() {
        assert_eq!(sniff(b"ID3\x04\x00"), Some(AudioContainer::Mpeg));
        assert_eq!(sniff(&[0xFF, 0xFB, 0x90, 0x00]), Some(AudioContainer::Mpeg));
        assert_eq!(sniff(&[0xFF, 0xF1, 0x50, 0x80]), Some(AudioContainer::Mpeg));
        assert_eq!(sniff(b"RIFF\x24\x00\x00\x00WAVE"), Some(AudioContainer::Wave));
        assert_eq!(sniff(b"fLaC\x00\x00"), Some(AudioContainer::Flac));
        assert_eq!(sniff(b"OggS\x00\x02"), Some(AudioContainer::Ogg));
        assert_eq!(sniff(b"\x00\x00\x00\x20ftypM4A "), Some(AudioContainer::Mp4));
        assert_eq!(sniff(&ASF_GUID), Some(AudioContainer::Asf));
    }

    #[test]
    fn rejects_non_audio() {
        assert_eq!(sniff(b"#!/bin/sh\nrm -rf"), None);
        assert_eq!(sniff(b"\x7FELF\x02\x01"), None);
        assert_eq!(sniff(b""), None);
    }

    #[test]
    fn extension_is_allow_listed() {
        assert_eq!(safe_extension(Some("Song.MP3")), "mp3");
        assert_eq!(safe_extension(Some("track.flac")), "flac");
        assert_eq!(safe_extension(Some("evil.sh")), "bin");
        assert_eq!(safe_extension(Some("noext")), "bin");
        assert_eq!(safe_extension(None), "bin");
    }
}
