use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ffmpeg::encoder;
use ffmpeg::util::frame::{audio::Audio, video::Video};
use ffmpeg_next::{
    self as ffmpeg, channel_layout::ChannelLayout, codec, decoder, filter, format, media, picture,
    software, Dictionary, Error, Packet, Rational,
};
use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use tracing::{debug, info};

const AUDIO_LAYOUT: ChannelLayout = ChannelLayout::STEREO;
const AUDIO_CHANNELS: usize = 2;
const AUDIO_BIT_RATE: usize = 128_000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Segment {
    pub(crate) image: PathBuf,
    pub(crate) audio: PathBuf,
    pub(crate) duration: Duration,
}

pub(crate) trait VideoEncoder: Send + Sync {
    fn encode(&self, segments: &[Segment], output_path: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct FfmpegEncoder {
    fps: i32,
    frame_height: u32,
    sample_rate: i32,
}

impl FfmpegEncoder {
    pub(crate) fn new(fps: u32, frame_height: u32) -> Self {
        Self {
            fps: fps.max(1) as i32,
            // yuv420p needs even dimensions
            frame_height: (frame_height + frame_height % 2).max(2),
            sample_rate: 44_100,
        }
    }

    fn frame_count(&self, duration: Duration) -> i64 {
        ((duration.as_secs_f64() * self.fps as f64).round() as i64).max(1)
    }

    /// Audio samples owed to the frames `[frames_before, frames_before + frames)`.
    ///
    /// Computed from running totals so rounding never accumulates across segments.
    fn sample_budget(&self, frames_before: i64, frames: i64) -> usize {
        let at = |frame: i64| frame * self.sample_rate as i64 / self.fps as i64;
        (at(frames_before + frames) - at(frames_before)) as usize
    }

    fn scale_to_height(&self, path: &Path) -> anyhow::Result<RgbImage> {
        let image = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .with_context(|| format!("failed to decode {}", path.display()))?;
        let width = (image.width() as f64 * self.frame_height as f64 / image.height() as f64)
            .round()
            .max(1.0) as u32;
        Ok(image
            .resize_exact(width, self.frame_height, FilterType::Lanczos3)
            .to_rgb8())
    }

    /// Scales every image to the frame height and centres it on a shared canvas
    /// as wide as the widest one.
    fn load_pictures(&self, segments: &[Segment]) -> anyhow::Result<Vec<RgbImage>> {
        let scaled = segments
            .iter()
            .map(|segment| self.scale_to_height(&segment.image))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let widest = scaled
            .iter()
            .map(RgbImage::width)
            .max()
            .ok_or(anyhow::anyhow!("No segments to encode"))?;
        let width = widest + widest % 2;

        Ok(scaled
            .into_iter()
            .map(|image| {
                if image.width() == width {
                    return image;
                }
                let mut canvas = RgbImage::new(width, self.frame_height);
                let x = (width - image.width()) / 2;
                imageops::overlay(&mut canvas, &image, x as i64, 0);
                canvas
            })
            .collect())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(&self, segments: &[Segment], output_path: &Path) -> anyhow::Result<()> {
        let pictures = self.load_pictures(segments)?;
        let (width, height) = pictures[0].dimensions();

        let mut output = format::output(&output_path)?;
        let mut video = VideoStream::new(&mut output, width, height, self.fps)?;
        let mut audio = AudioStream::new(&mut output, self.sample_rate)?;
        output.write_header()?;

        let video_time_base = output
            .stream(video.index)
            .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
            .time_base();
        let audio_time_base = output
            .stream(audio.index)
            .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
            .time_base();

        let mut frames_written = 0;
        for (index, (segment, picture)) in segments.iter().zip(&pictures).enumerate() {
            let channels = audio
                .decode(&segment.audio)
                .with_context(|| format!("failed to decode {}", segment.audio.display()))?;
            let decoded =
                Duration::from_secs_f64(channels[0].len() as f64 / self.sample_rate as f64);
            let frames = self.frame_count(segment.duration.min(decoded));
            debug!(index, frames, duration = ?segment.duration, ?decoded, "Encoding segment");

            video.write_picture(picture, frames, &mut output, video_time_base)?;
            let samples = self.sample_budget(frames_written, frames);
            frames_written += frames;
            audio.write_samples(channels, samples, &mut output, audio_time_base)?;
        }

        video.finish(&mut output, video_time_base)?;
        audio.finish(&mut output, audio_time_base)?;
        output.write_trailer()?;

        info!(
            path = %output_path.display(),
            segments = segments.len(),
            frames = frames_written,
            "Video encoded"
        );
        Ok(())
    }
}

struct VideoStream {
    index: usize,
    encoder: encoder::Video,
    scaler: software::scaling::Context,
    time_base: Rational,
    next_pts: i64,
}

impl VideoStream {
    fn new(
        output: &mut format::context::Output,
        width: u32,
        height: u32,
        fps: i32,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let time_base = Rational(1, fps);

        let codec =
            encoder::find(codec::Id::H264).ok_or(anyhow::anyhow!(Error::EncoderNotFound))?;
        let mut output_stream = output.add_stream(codec)?;
        let index = output_stream.index();
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(format::Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational(fps, 1)));
        encoder.set_time_base(time_base);
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", "medium");

        let opened_encoder = encoder.open_with(opts)?;
        output_stream.set_parameters(&opened_encoder);
        output_stream.set_time_base(time_base);

        let scaler = software::scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            format::Pixel::YUV420P,
            width,
            height,
            software::scaling::Flags::BILINEAR,
        )?;

        Ok(Self {
            index,
            encoder: opened_encoder,
            scaler,
            time_base,
            next_pts: 0,
        })
    }

    fn write_picture(
        &mut self,
        image: &RgbImage,
        frames: i64,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut rgb = Video::new(format::Pixel::RGB24, image.width(), image.height());
        let stride = rgb.stride(0);
        let row = image.width() as usize * 3;
        let data = rgb.data_mut(0);
        for (y, pixels) in image.as_raw().chunks_exact(row).enumerate() {
            data[y * stride..y * stride + row].copy_from_slice(pixels);
        }

        let mut frame = Video::empty();
        self.scaler.run(&rgb, &mut frame)?;
        frame.set_kind(picture::Type::None);
        for _ in 0..frames {
            frame.set_pts(Some(self.next_pts));
            self.next_pts += 1;
            self.encoder.send_frame(&frame)?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn finish(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        self.receive_and_process_encoded_packets(output, output_stream_time_base)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.index);
            packet.rescale_ts(self.time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

struct AudioStream {
    index: usize,
    encoder: encoder::Audio,
    sample_format: format::Sample,
    sample_rate: i32,
    frame_size: usize,
    time_base: Rational,
    /// Planar samples not yet handed to the encoder, one buffer per channel.
    pending: Vec<Vec<f32>>,
    next_pts: i64,
}

impl AudioStream {
    fn new(output: &mut format::context::Output, sample_rate: i32) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let sample_format = format::Sample::F32(format::sample::Type::Planar);
        let time_base = Rational(1, sample_rate);

        let codec = encoder::find(codec::Id::AAC)
            .ok_or(anyhow::anyhow!(Error::EncoderNotFound))?
            .audio()?;
        let mut output_stream = output.add_stream(codec)?;
        let index = output_stream.index();
        let context = codec::context::Context::from_parameters(output_stream.parameters())?;
        let mut encoder = context.encoder().audio()?;

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        encoder.set_channel_layout(AUDIO_LAYOUT);
        encoder.set_rate(sample_rate);
        encoder.set_format(sample_format);
        encoder.set_bit_rate(AUDIO_BIT_RATE);
        encoder.set_time_base(time_base);
        output_stream.set_time_base(time_base);

        let opened_encoder = encoder.open_as(codec)?;
        output_stream.set_parameters(&opened_encoder);
        let frame_size = (opened_encoder.frame_size() as usize).max(1);

        Ok(Self {
            index,
            encoder: opened_encoder,
            sample_format,
            sample_rate,
            frame_size,
            time_base,
            pending: vec![Vec::new(); AUDIO_CHANNELS],
            next_pts: 0,
        })
    }

    fn decode(&self, path: &Path) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut input = format::input(&path)?;
        let (stream_index, mut decoder) = {
            let stream = input
                .streams()
                .best(media::Type::Audio)
                .ok_or(anyhow::anyhow!(Error::StreamNotFound))?;
            let decoder = codec::context::Context::from_parameters(stream.parameters())?
                .decoder()
                .audio()?;
            (stream.index(), decoder)
        };
        let mut filter_graph = self.filter_graph(&decoder)?;

        let mut channels = vec![Vec::new(); AUDIO_CHANNELS];
        for (stream, packet) in input.packets() {
            if stream.index() == stream_index {
                decoder.send_packet(&packet)?;
                Self::receive_decoded_frames(&mut decoder, &mut filter_graph, &mut channels)?;
            }
        }
        decoder.send_eof()?;
        Self::receive_decoded_frames(&mut decoder, &mut filter_graph, &mut channels)?;

        filter_graph
            .get("in")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .source()
            .flush()
            .map_err(|e| anyhow::anyhow!(e))?;
        Self::receive_filtered_frames(&mut filter_graph, &mut channels)?;

        Ok(channels)
    }

    fn filter_graph(&self, decoder: &decoder::Audio) -> anyhow::Result<filter::Graph> {
        let mut filter_graph = filter::Graph::new();

        let input_layout = if decoder.channel_layout().is_empty() {
            ChannelLayout::default(decoder.channels() as i32)
        } else {
            decoder.channel_layout()
        };
        let args = format!(
            "time_base=1/{rate}:sample_rate={rate}:sample_fmt={}:channel_layout=0x{:x}",
            decoder.format().name(),
            input_layout.bits(),
            rate = decoder.rate(),
        );

        filter_graph.add(
            &filter::find("abuffer").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "in",
            &args,
        )?;
        filter_graph.add(
            &filter::find("abuffersink").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "out",
            "",
        )?;

        {
            let mut out = filter_graph
                .get("out")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?;
            out.set_sample_format(self.sample_format);
            out.set_channel_layout(AUDIO_LAYOUT);
            out.set_sample_rate(self.sample_rate as u32);
        }

        filter_graph
            .output("in", 0)?
            .input("out", 0)?
            .parse(&format!("aresample={}", self.sample_rate))?;
        filter_graph.validate()?;

        Ok(filter_graph)
    }

    fn receive_decoded_frames(
        decoder: &mut decoder::Audio,
        filter_graph: &mut filter::Graph,
        channels: &mut [Vec<f32>],
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while decoder.receive_frame(&mut frame).is_ok() {
            filter_graph
                .get("in")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?
                .source()
                .add(&frame)
                .map_err(|e| anyhow::anyhow!(e))?;
            Self::receive_filtered_frames(filter_graph, channels)?;
        }
        Ok(())
    }

    fn receive_filtered_frames(
        filter_graph: &mut filter::Graph,
        channels: &mut [Vec<f32>],
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while filter_graph
            .get("out")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .sink()
            .frame(&mut frame)
            .is_ok()
        {
            for (channel, samples) in channels.iter_mut().enumerate() {
                samples.extend_from_slice(frame.plane::<f32>(channel));
            }
        }
        Ok(())
    }

    /// Queues exactly `samples` samples per channel, padding with silence or
    /// trimming, then encodes every full frame.
    fn write_samples(
        &mut self,
        channels: Vec<Vec<f32>>,
        samples: usize,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        for (pending, mut channel) in self.pending.iter_mut().zip(channels) {
            channel.resize(samples, 0.0);
            pending.extend(channel);
        }
        while self.pending[0].len() >= self.frame_size {
            self.send_pending(self.frame_size, output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_pending(
        &mut self,
        count: usize,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::new(self.sample_format, count, AUDIO_LAYOUT);
        frame.set_rate(self.sample_rate as u32);
        for (channel, pending) in self.pending.iter_mut().enumerate() {
            frame
                .plane_mut::<f32>(channel)
                .copy_from_slice(&pending[..count]);
            pending.drain(..count);
        }
        frame.set_pts(Some(self.next_pts));
        self.next_pts += count as i64;

        self.encoder.send_frame(&frame)?;
        self.receive_and_process_encoded_packets(output, output_stream_time_base)
    }

    fn finish(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let remaining = self.pending[0].len();
        if remaining > 0 {
            self.send_pending(remaining, output, output_stream_time_base)?;
        }
        self.encoder.send_eof()?;
        self.receive_and_process_encoded_packets(output, output_stream_time_base)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.index);
            packet.rescale_ts(self.time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, image::Rgb([10, 200, 90]))
            .save(path)
            .unwrap();
    }

    fn segment(image: PathBuf, millis: u64) -> Segment {
        Segment {
            image,
            audio: PathBuf::from("unused.wav"),
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn frame_count_follows_audio_duration() {
        let encoder = FfmpegEncoder::new(24, 720);
        assert_eq!(encoder.frame_count(Duration::from_secs(2)), 48);
        assert_eq!(encoder.frame_count(Duration::from_millis(1010)), 24);
        assert_eq!(encoder.frame_count(Duration::ZERO), 1);
    }

    #[test]
    fn sample_budgets_do_not_drift() {
        let encoder = FfmpegEncoder::new(24, 720);
        let segments = [13_i64, 7, 29, 1, 50];
        let mut frames_before = 0;
        let mut total = 0;
        for frames in segments {
            total += encoder.sample_budget(frames_before, frames);
            frames_before += frames;
        }
        assert_eq!(total as i64, frames_before * 44_100 / 24);
    }

    #[test]
    fn pictures_share_an_even_canvas_at_frame_height() {
        let dir = tempfile::tempdir().unwrap();
        let wide = dir.path().join("frame_0.png");
        let tall = dir.path().join("frame_1.png");
        write_png(&wide, 1001, 500);
        write_png(&tall, 300, 600);

        let encoder = FfmpegEncoder::new(24, 720);
        let pictures = encoder
            .load_pictures(&[segment(wide, 500), segment(tall, 500)])
            .unwrap();

        assert_eq!(pictures[0].dimensions(), (1442, 720));
        assert_eq!(pictures[1].dimensions(), (1442, 720));
        // narrower picture is centred on black
        assert_eq!(pictures[1].get_pixel(0, 360), &image::Rgb([0, 0, 0]));
        assert_ne!(pictures[1].get_pixel(721, 360), &image::Rgb([0, 0, 0]));
    }

    #[test]
    fn decodes_images_regardless_of_extension() {
        let dir = tempfile::tempdir().unwrap();
        let jpeg_named_png = dir.path().join("frame_0.png");
        RgbImage::from_pixel(64, 32, image::Rgb([255, 255, 255]))
            .save_with_format(&jpeg_named_png, image::ImageFormat::Jpeg)
            .unwrap();

        let encoder = FfmpegEncoder::new(24, 720);
        let picture = encoder.scale_to_height(&jpeg_named_png).unwrap();
        assert_eq!(picture.dimensions(), (1440, 720));
    }

    #[test]
    fn encodes_segments_into_a_playable_mp4() {
        ffmpeg::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut segments = Vec::new();
        for (index, millis) in [500_u64, 750].into_iter().enumerate() {
            let image = dir.path().join(format!("frame_{index}.png"));
            let audio = dir.path().join(format!("audio_{index}.wav"));
            write_png(&image, 64, 48);
            crate::speech::tests::write_silence(&audio, Duration::from_millis(millis));
            segments.push(Segment {
                image,
                audio,
                duration: Duration::from_millis(millis),
            });
        }
        let output_path = dir.path().join("story.mp4");

        FfmpegEncoder::new(24, 64)
            .encode(&segments, &output_path)
            .unwrap();

        let input = format::input(&output_path).unwrap();
        let count = |kind: media::Type| {
            input
                .streams()
                .filter(|stream| stream.parameters().medium() == kind)
                .count()
        };
        assert_eq!(count(media::Type::Video), 1);
        assert_eq!(count(media::Type::Audio), 1);

        let video = input.streams().best(media::Type::Video).unwrap();
        let decoder = codec::context::Context::from_parameters(video.parameters())
            .unwrap()
            .decoder()
            .video()
            .unwrap();
        assert_eq!((decoder.width(), decoder.height()), (86, 64));

        let seconds = input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
        assert!((seconds - 1.25).abs() < 0.15, "{seconds}");
    }

    #[test]
    fn odd_frame_height_is_rounded_up() {
        let encoder = FfmpegEncoder::new(24, 719);
        assert_eq!(encoder.frame_height, 720);
    }
}
