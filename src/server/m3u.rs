//! M3U playlist generation.
//!
//! Emits the same lineup as `/lineup.json` in playlist form, with `tvg-*`
//! attributes carrying the guide id, channel number, and logo so Plex (and
//! generic IPTV players) can join the playlist against `/epg/xmltv`.

use crate::db::models::Channel;

/// Build the playlist for the enabled channels.
pub fn generate_m3u_playlist(channels: &[Channel], base_url: &str) -> String {
    let mut out = String::with_capacity(128 + channels.len() * 160);
    out.push_str(&format!("#EXTM3U url-tvg=\"{}/epg/xmltv\"\n", base_url));

    for channel in channels {
        out.push_str("#EXTINF:-1");
        if let Some(epg_id) = &channel.epg_id {
            out.push_str(&format!(" tvg-id=\"{}\"", attr_escape(epg_id)));
        }
        out.push_str(&format!(" tvg-chno=\"{}\"", channel.number));
        if let Some(logo) = &channel.logo_url {
            out.push_str(&format!(" tvg-logo=\"{}\"", attr_escape(logo)));
        }
        out.push_str(&format!(",{}\n", channel.name));
        out.push_str(&format!("{}/stream/{}\n", base_url, channel.number));
    }

    out
}

/// Double quotes inside attribute values would break the EXTINF line.
fn attr_escape(s: &str) -> String {
    s.replace('"', "'")
}
