//! Synthesises small MP4 clips for backend tests.

use std::path::Path;

use crate::media::infrastructure::ffmpeg_mux_session::set_rotation;

pub struct ClipParams {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub fps: i32,
    pub with_audio: bool,
    pub audio_rate: i32,
    /// Clockwise degrees, stored as a display matrix.
    pub rotation: i32,
}

impl Default for ClipParams {
    fn default() -> Self {
        Self {
            frames: 24,
            width: 160,
            height: 120,
            fps: 24,
            with_audio: true,
            audio_rate: 48_000,
            rotation: 0,
        }
    }
}

/// MPEG-4 Part 2 video (grey ramp) plus an optional mono AAC sine tone,
/// both lasting `frames / fps` seconds.
pub fn write_test_clip(path: &Path, params: &ClipParams) {
    ffmpeg_next::init().unwrap();

    let mut octx = ffmpeg_next::format::output(&path).unwrap();
    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

    let video_codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4).unwrap();
    let mut ost = octx.add_stream(Some(video_codec)).unwrap();
    let mut video_ctx = ffmpeg_next::codec::context::Context::new_with_codec(video_codec)
        .encoder()
        .video()
        .unwrap();
    video_ctx.set_width(params.width);
    video_ctx.set_height(params.height);
    video_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
    video_ctx.set_time_base(ffmpeg_next::Rational(1, params.fps));
    video_ctx.set_frame_rate(Some(ffmpeg_next::Rational(params.fps, 1)));
    if global_header {
        video_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }
    let mut video_encoder = video_ctx.open_with(ffmpeg_next::Dictionary::new()).unwrap();
    ost.set_parameters(&video_encoder);
    if params.rotation != 0 {
        set_rotation(&mut ost, params.rotation).unwrap();
    }

    let mut audio = if params.with_audio {
        let audio_codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).unwrap();
        let mut ost = octx.add_stream(Some(audio_codec)).unwrap();
        let mut audio_ctx = ffmpeg_next::codec::context::Context::new_with_codec(audio_codec)
            .encoder()
            .audio()
            .unwrap();
        audio_ctx.set_rate(params.audio_rate);
        audio_ctx.set_channel_layout(ffmpeg_next::ChannelLayout::MONO);
        audio_ctx.set_format(ffmpeg_next::format::Sample::F32(
            ffmpeg_next::format::sample::Type::Planar,
        ));
        audio_ctx.set_time_base(ffmpeg_next::Rational(1, params.audio_rate));
        if global_header {
            audio_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = audio_ctx.open_as(audio_codec).unwrap();
        ost.set_parameters(&encoder);
        Some((ost.index(), encoder))
    } else {
        None
    };

    octx.write_header().unwrap();

    let video_tb = octx.stream(0).unwrap().time_base();
    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        ffmpeg_next::format::Pixel::RGB24,
        params.width,
        params.height,
        ffmpeg_next::format::Pixel::YUV420P,
        params.width,
        params.height,
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )
    .unwrap();

    for i in 0..params.frames {
        let mut rgb = ffmpeg_next::util::frame::video::Video::new(
            ffmpeg_next::format::Pixel::RGB24,
            params.width,
            params.height,
        );
        let stride = rgb.stride(0);
        let value = ((i * 40) % 256) as u8;
        let data = rgb.data_mut(0);
        for row in 0..params.height as usize {
            let start = row * stride;
            data[start..start + params.width as usize * 3].fill(value);
        }

        let mut yuv = ffmpeg_next::util::frame::video::Video::empty();
        scaler.run(&rgb, &mut yuv).unwrap();
        yuv.set_pts(Some(i as i64));
        video_encoder.send_frame(&yuv).unwrap();
        write_packets(&mut video_encoder, &mut octx, 0, ffmpeg_next::Rational(1, params.fps), video_tb);
    }
    video_encoder.send_eof().unwrap();
    write_packets(&mut video_encoder, &mut octx, 0, ffmpeg_next::Rational(1, params.fps), video_tb);

    if let Some((index, mut encoder)) = audio.take() {
        let audio_tb = octx.stream(index).unwrap().time_base();
        let enc_tb = ffmpeg_next::Rational(1, params.audio_rate);
        let frame_size = match encoder.frame_size() {
            0 => 1024,
            n => n as usize,
        };
        let total = params.audio_rate as usize * params.frames / params.fps as usize;
        let mut pts = 0usize;
        while pts < total {
            let n = frame_size.min(total - pts);
            let mut frame = ffmpeg_next::util::frame::audio::Audio::new(
                ffmpeg_next::format::Sample::F32(ffmpeg_next::format::sample::Type::Planar),
                n,
                ffmpeg_next::ChannelLayout::MONO,
            );
            frame.set_rate(params.audio_rate as u32);
            frame.set_pts(Some(pts as i64));
            let plane = frame.data_mut(0);
            for s in 0..n {
                let t = (pts + s) as f32 / params.audio_rate as f32;
                let v = (t * 440.0 * std::f32::consts::TAU).sin() * 0.25;
                plane[s * 4..s * 4 + 4].copy_from_slice(&v.to_ne_bytes());
            }
            encoder.send_frame(&frame).unwrap();
            write_audio_packets(&mut encoder, &mut octx, index, enc_tb, audio_tb);
            pts += n;
        }
        encoder.send_eof().unwrap();
        write_audio_packets(&mut encoder, &mut octx, index, enc_tb, audio_tb);
    }

    octx.write_trailer().unwrap();
}

fn write_packets(
    encoder: &mut ffmpeg_next::codec::encoder::video::Encoder,
    octx: &mut ffmpeg_next::format::context::Output,
    index: usize,
    enc_tb: ffmpeg_next::Rational,
    ost_tb: ffmpeg_next::Rational,
) {
    let mut packet = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(index);
        packet.rescale_ts(enc_tb, ost_tb);
        packet.write_interleaved(octx).unwrap();
    }
}

fn write_audio_packets(
    encoder: &mut ffmpeg_next::codec::encoder::audio::Encoder,
    octx: &mut ffmpeg_next::format::context::Output,
    index: usize,
    enc_tb: ffmpeg_next::Rational,
    ost_tb: ffmpeg_next::Rational,
) {
    let mut packet = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(index);
        packet.rescale_ts(enc_tb, ost_tb);
        packet.write_interleaved(octx).unwrap();
    }
}
