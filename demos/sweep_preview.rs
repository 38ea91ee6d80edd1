use diffusion_worker::*;

fn main() {
    logging::init_tracing("diffusion_worker=info");

    let settings = GenerationSettings {
        prompts: settings::split_prompts("a lighthouse at dusk\na ~~weather harbor"),
        negative_prompt: settings::collapse_negative_prompt("blurry,\nlow quality"),
        iterations: 2,
        steps: vec![25, 40],
        scales_txt: settings::parse_extra_values("6.5, 9", 7.0),
        refiner_strengths: vec![0.3],
        seed: 1234,
        model: "/models/sdxl_base.safetensors".into(),
        ..Default::default()
    };

    let source = MapWildcards::new().with_list("weather", ["foggy", "stormy"]);
    let mut wildcards = WildcardExpander::new(source);

    let jobs = expand(&settings, &[], &ExpansionOptions::default(), &mut wildcards).unwrap();
    for line in jobs.summary_lines() {
        println!("{}", line);
    }

    for request in &jobs.requests {
        println!("{}", WorkerCommand::generate(request).to_line().unwrap());
    }

    let startup = StartupOptions::new(GenerationMode::Txt2Img, &settings.model, "/tmp/out")
        .with_seamless(settings.seamless_mode);
    println!("worker args: {}", startup.to_args().join(" "));
    println!("fingerprint: {}", startup.fingerprint());
}
