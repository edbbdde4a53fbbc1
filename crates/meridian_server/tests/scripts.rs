mod common;

use common::*;

const POLY8: &str = r#"{"type":"Polygon","coordinates":[[[-122.4408378,37.7341129],[-122.4408378,37.733],[-122.44,37.733],[-122.44,37.7341129],[-122.4408378,37.7341129]],[[-122.44060993194579,37.73345766902749],[-122.44044363498686,37.73345766902749],[-122.44044363498686,37.73355524732416],[-122.44060993194579,37.73355524732416],[-122.44060993194579,37.73345766902749]],[[-122.44060724973677,37.7336888869566],[-122.4402102828026,37.7336888869566],[-122.4402102828026,37.7339752567853],[-122.44060724973677,37.7339752567853],[-122.44060724973677,37.7336888869566]]]}"#;
const POLY9: &str = r#"{"type":"Polygon","coordinates":[[[-122.44037926197052,37.73313523548048],[-122.44017541408539,37.73313523548048],[-122.44017541408539,37.73336857568778],[-122.44037926197052,37.73336857568778],[-122.44037926197052,37.73313523548048]]]}"#;
const POLY10: &str = r#"{"type":"Polygon","coordinates":[[[-122.44040071964262,37.73359343010089],[-122.4402666091919,37.73359343010089],[-122.4402666091919,37.73373767596864],[-122.44040071964262,37.73373767596864],[-122.44040071964262,37.73359343010089]]]}"#;

#[test]
fn test_scripts_basic() {
    let server = setup();
    do_batch(
        &server,
        &[
            (&["EVAL", "return 2 + 2", "0"], "4"),
            (
                &["SCRIPT", "LOAD", "return 2 + 2"],
                "2dd1b44209ecb49617af05caf0491390a03c1cc4",
            ),
            (
                &[
                    "SCRIPT",
                    "EXISTS",
                    "2dd1b44209ecb49617af05caf0491390a03c1cc4",
                    "no_script",
                ],
                "[1 0]",
            ),
            (
                &["EVALSHA", "2dd1b44209ecb49617af05caf0491390a03c1cc4", "0"],
                "4",
            ),
            (&["SCRIPT", "FLUSH"], "OK"),
            (
                &[
                    "SCRIPT",
                    "EXISTS",
                    "2dd1b44209ecb49617af05caf0491390a03c1cc4",
                    "no_script",
                ],
                "[0 0]",
            ),
            (
                &["EVAL", "return KEYS[1] .. ' only'", "1", "key1"],
                "key1 only",
            ),
            (
                &[
                    "EVAL",
                    "return KEYS[1] .. ' and ' .. ARGV[1]",
                    "1",
                    "key1",
                    "arg1",
                ],
                "key1 and arg1",
            ),
            (
                &[
                    "EVAL",
                    "return ARGV[1] .. ' and ' .. ARGV[2]",
                    "0",
                    "arg1",
                    "arg2",
                ],
                "arg1 and arg2",
            ),
            (
                &["EVAL", "return tile38.sha1hex('asdf')", "0"],
                "3da541559918a808c2402bba5012f6c60b27661c",
            ),
            (
                &[
                    "EVAL",
                    "return tile38.distance_to(37.7341129, -122.4408378, 37.733, -122.43)",
                    "0",
                ],
                "961",
            ),
            (&["EVAL", "return tile38.get('mykey', 'myid1')", "0"], "nil"),
            (
                &[
                    "EVAL",
                    "return tile38.call('set', KEYS[1], ARGV[1], 'point', 33.1234, -115.1234)",
                    "1",
                    "mykey",
                    "myid1",
                ],
                "OK",
            ),
            (
                &[
                    "EVAL",
                    "local obj = tile38.get('mykey', 'myid1').object; return {tostring(obj.x), tostring(obj.y)}",
                    "0",
                ],
                "[-115.1234 33.1234]",
            ),
            (
                &[
                    "EVAL",
                    "return tile38.call('set', KEYS[1], ARGV[1], 'string', 'foobar')",
                    "1",
                    "mykey",
                    "myid2",
                ],
                "OK",
            ),
            (
                &[
                    "EVAL",
                    "local obj = tile38.get('mykey', 'myid2').object; return tostring(obj)",
                    "0",
                ],
                "foobar",
            ),
        ],
    );
}

#[test]
fn test_scripts_atomic() {
    let server = setup();
    do_batch(
        &server,
        &[
            (
                &[
                    "EVAL",
                    "return tile38.call('get', KEYS[1], ARGV[1])",
                    "1",
                    "mykey",
                    "myid",
                ],
                "nil",
            ),
            (
                &[
                    "EVAL",
                    "return tile38.call('set', KEYS[1], ARGV[1], 'point', 33, -115)",
                    "1",
                    "mykey",
                    "myid1",
                ],
                "OK",
            ),
            (
                &[
                    "EVAL",
                    "return tile38.call('get', KEYS[1], ARGV[1], ARGV[2])",
                    "1",
                    "mykey",
                    "myid1",
                    "point",
                ],
                "[33 -115]",
            ),
        ],
    );
}

#[test]
fn test_scripts_readonly() {
    let server = setup();

    assert_eq!(
        do_cmd(
            &server,
            &[
                "EVALRO",
                "return tile38.call('get', KEYS[1], ARGV[1])",
                "1",
                "mykey",
                "myid",
            ],
        ),
        "nil"
    );

    // A raising nested write: the script fails with a stack that contains
    // the read-only error.
    let reply = do_cmd(
        &server,
        &[
            "EVALRO",
            "return tile38.call('set', KEYS[1], ARGV[1], 'point', 33, -115)",
            "1",
            "mykey",
            "myid1",
        ],
    );
    assert!(
        reply.contains("ERR read only"),
        "unexpected reply: {}",
        reply
    );

    // The protected variant returns the error record verbatim.
    assert_eq!(
        do_cmd(
            &server,
            &[
                "EVALRO",
                "return tile38.pcall('set', KEYS[1], ARGV[1], 'point', 33, -115)",
                "1",
                "mykey",
                "myid1",
            ],
        ),
        "ERR read only"
    );

    // Nothing was written.
    assert_eq!(do_cmd(&server, &["GET", "mykey", "myid1"]), "nil");

    do_batch(
        &server,
        &[
            (&["SET", "mykey", "myid1", "POINT", "33", "-115"], "OK"),
            (
                &[
                    "EVALRO",
                    "return tile38.call('get', KEYS[1], ARGV[1], ARGV[2])",
                    "1",
                    "mykey",
                    "myid1",
                    "point",
                ],
                "[33 -115]",
            ),
        ],
    );
}

#[test]
fn test_scripts_nonatomic() {
    let server = setup();
    do_batch(
        &server,
        &[
            (
                &[
                    "EVALNA",
                    "return tile38.call('get', KEYS[1], ARGV[1])",
                    "1",
                    "mykey",
                    "myid",
                ],
                "nil",
            ),
            (
                &[
                    "EVALNA",
                    "return tile38.call('set', KEYS[1], ARGV[1], 'point', 33, -115)",
                    "1",
                    "mykey",
                    "myid1",
                ],
                "OK",
            ),
            (
                &[
                    "EVALNA",
                    "return tile38.call('get', KEYS[1], ARGV[1], ARGV[2])",
                    "1",
                    "mykey",
                    "myid1",
                    "point",
                ],
                "[33 -115]",
            ),
        ],
    );
}

#[test]
fn test_scripts_iterate() {
    let script_ids = r#"
        local result = {}
        local cursor

        local function process(iterator)
            result[#result + 1] = iterator.id
            return false  -- early stop, after the first object
        end

        cursor = tile38.iterate(
            process, 'WITHIN', 'key2', 'ids', 'get', 'mykey', 'poly8')

        return {cursor, result}
    "#;
    let script_obj = r#"
        local result = {}
        local cursor

        local function process(iterator)
            result[#result + 1] = iterator.object.json
            return true  -- no early stop, go through all objects
        end

        cursor = tile38.iterate(
            process, 'WITHIN', 'key2', 'ids', 'get', 'mykey', 'poly8')

        return {cursor, result}
    "#;
    let script_fields = r#"
        local result = {}
        local cursor

        local function process(iterator)
            result[#result + 1] = {iterator:read_fields('foo', 'bar')}
            return false  -- early stop, after the first object
        end

        cursor = tile38.iterate(
            process, 'WITHIN', 'key2', 'ids', 'get', 'mykey', 'poly8')

        return {cursor, result}
    "#;
    let script_nearby_ids = r#"
        local result = {}
        local cursor

        local function process(iterator)
            result[#result + 1] = iterator.id
            return false  -- early stop, after the first object
        end

        cursor = tile38.iterate(
            process, 'NEARBY', 'key2', 'ids', 'point', 37.7335, -122.4412)

        return {cursor, result}
    "#;

    let server = setup();
    do_batch(
        &server,
        &[
            (&["SET", "mykey", "poly8", "OBJECT", POLY8], "OK"),
            (
                &[
                    "SET", "key2", "poly9", "FIELD", "foo", "1", "FIELD", "bar", "10", "OBJECT",
                    POLY9,
                ],
                "OK",
            ),
            (&["SET", "key2", "poly10", "OBJECT", POLY10], "OK"),
            (&["SET", "key2", "poly11", "OBJECT", POLY10], "OK"),
            (&["SET", "key2", "poly12", "OBJECT", POLY10], "OK"),
            // Sanity: WITHIN picks poly9 in this setup.
            (
                &[
                    "WITHIN", "key2", "LIMIT", "1", "IDS", "GET", "mykey", "poly8",
                ],
                "[1 [poly9]]",
            ),
            (&["EVAL", script_ids, "0"], "[1 [poly9]]"),
            (&["EVAL", script_fields, "0"], "[1 [[1 10]]]"),
            (&["EVAL", script_nearby_ids, "0"], "[1 [poly10]]"),
        ],
    );

    // Full run: no early stop, cursor comes back as zero.
    let reply = do_cmd(&server, &["EVAL", script_obj, "0"]);
    assert_eq!(reply, format!("[0 [{}]]", POLY9));
}

#[test]
fn test_scripts_piterate_reports_errors() {
    let server = setup();
    let script = r#"
        local ok, cursor = tile38.piterate(
            function(iterator) return true end,
            'WITHIN', 'nokey', 'ids', 'get', 'mykey', 'missing')
        return {tostring(ok), cursor}
    "#;
    let reply = do_cmd(&server, &["EVAL", script, "0"]);
    assert!(reply.contains("false"), "unexpected reply: {}", reply);
    assert!(reply.contains("key not found"), "unexpected reply: {}", reply);
}

#[test]
fn test_scripts_math() {
    let script_mean_std_min_max = r#"
        local data = {[1]=99, [2]=88, [3]=77}

        local mean, std, min, max

        mean, std, min, max = tile38.mean_std_min_max(data)

        return {mean, std, min, max}
    "#;
    let script_cdf = r#"
        local mean, std, min

        mean = 99
        std = 8
        min = 77

        local cdf

        cdf = tile38.cdf(90, 10, mean, std)

        return {cdf * 100}
    "#;

    let server = setup();
    do_batch(
        &server,
        &[
            (&["EVAL", script_cdf, "0"], "[13]"),
            (&["EVAL", script_mean_std_min_max, "0"], "[88 8 77 99]"),
        ],
    );
}

#[test]
fn test_scripts_score_adjusted() {
    let script_score_adjusted = r#"
        local algorithm = {algorithm="classic"}
        local scores = {[1]=99, [2]=88, [3]=77}
        local distances = {[1]=100, [2]=50, [3]=200}
        local ages = {[1]=100, [2]=200, [3]=300}

        local adjusted_scores = tile38.adjusted_similarity_scores(
            algorithm, scores, distances, ages)

        return adjusted_scores
    "#;
    let script_score_adjusted_params = r#"
        local algorithm = {algorithm="classic",distMaxPenalty=10,ageMaxPenalty=20}
        local scores = {[1]=99, [2]=88, [3]=77}
        local distances = {[1]=100, [2]=50, [3]=200}
        local ages = {[1]=100, [2]=200, [3]=300}

        local adjusted_scores = tile38.adjusted_similarity_scores(
            algorithm, scores, distances, ages)

        return adjusted_scores
    "#;

    let server = setup();
    do_batch(
        &server,
        &[
            (&["EVAL", script_score_adjusted, "0"], "[[1 98] [2 80] [3 58]]"),
            (
                &["EVAL", script_score_adjusted_params, "0"],
                "[[1 96] [2 80] [3 53]]",
            ),
        ],
    );
}

#[test]
fn test_scripts_score_adjusted_unknown_algorithm() {
    let script = r#"
        local algorithm = {algorithm="bogus"}
        return tile38.adjusted_similarity_scores(
            algorithm, {[1]=99}, {[1]=100}, {[1]=100})
    "#;
    let server = setup();
    let reply = do_cmd(&server, &["EVAL", script, "0"]);
    assert!(
        reply.contains("similarity 'bogus' algorithm not implemented"),
        "unexpected reply: {}",
        reply
    );
}

#[test]
fn test_scripts_stats_array() {
    let script = r#"
        local data = tile38.new_stats_array()
        data:append(100)
        data:append(110)
        data:append(200)
        data:append(210)

        local min_cdf = data:cdf(data:min())
        local cdf = data:cdf(200)

        return {min_cdf*100, cdf*100}
    "#;
    let server = setup();
    do_batch(&server, &[(&["EVAL", script, "0"], "[13 81]")]);
}

#[test]
fn test_scripts_stats_array_operators() {
    let script = r#"
        local a = tile38.new_stats_array()
        a:append(1) a:append(2) a:append(3)
        local b = tile38.new_stats_array()
        b:append(10) b:append(20)

        a = a + b          -- element-wise, truncated to shorter
        a = a * 2

        local c = a:copy()
        c:clamp(0, 30)

        return {a[1], a[2], c[1], c[2], c:max()}
    "#;
    let server = setup();
    // a = [11, 22] → [22, 44]; c clamped to [22, 30].
    do_batch(&server, &[(&["EVAL", script, "0"], "[22 44 22 30 30]")]);
}

#[test]
fn test_scripts_stats_array_indexes() {
    let script = r#"
        local data = tile38.new_stats_array()
        data:append(5) data:append(1) data:append(9) data:append(3)
        return {data:min_indexes(2), data:max_indexes(2)}
    "#;
    let server = setup();
    do_batch(&server, &[(&["EVAL", script, "0"], "[[2 4] [3 1]]")]);
}

#[test]
fn test_scripts_fingerprint_roundtrip() {
    let server = setup();
    let source = "return ARGV[1] .. '!'";
    let direct = do_cmd(&server, &["EVAL", source, "0", "hey"]);
    let sha = do_cmd(&server, &["SCRIPT", "LOAD", source]);
    assert_eq!(sha.len(), 40);
    let via_sha = do_cmd(&server, &["EVALSHA", &sha, "0", "hey"]);
    assert_eq!(direct, via_sha);
    assert_eq!(direct, "hey!");

    assert_eq!(
        do_cmd(&server, &["EVALSHA", "0000000000000000000000000000000000000000", "0"]),
        "ERR sha not found"
    );
}

#[test]
fn test_scripts_forbidden_commands() {
    let server = setup();
    for cmd in ["follow", "config", "eval", "script"] {
        let script = format!("return tile38.pcall('{}')", cmd);
        let reply = do_cmd(&server, &["EVAL", &script, "0"]);
        assert_eq!(
            reply, "ERR command not supported in scripts",
            "command {}",
            cmd
        );
    }
}

#[test]
fn test_scripts_new_globals_forbidden() {
    let server = setup();
    let reply = do_cmd(&server, &["EVAL", "leak = 1; return leak", "0"]);
    assert!(
        reply.contains("attempt to create global variable"),
        "unexpected reply: {}",
        reply
    );
}

#[test]
fn test_scripts_deadline_aborts_busy_loop() {
    let server = setup();
    let reply = do_cmd(
        &server,
        &["TIMEOUT", "0.05", "EVAL", "while true do end", "0"],
    );
    assert_eq!(reply, "ERR timeout");
}

#[test]
fn test_scripts_error_and_status_reply() {
    let server = setup();
    do_batch(
        &server,
        &[
            (&["EVAL", "return tile38.status_reply('GOOD')", "0"], "GOOD"),
            (
                &["EVAL", "return tile38.error_reply('bad thing')", "0"],
                "bad thing",
            ),
        ],
    );
}

#[test]
fn test_scripts_json_module() {
    let server = setup();
    do_batch(
        &server,
        &[
            (
                &[
                    "EVAL",
                    "local t = json.decode('{\"a\":[1,2,3]}'); return t.a[2]",
                    "0",
                ],
                "2",
            ),
            (
                &["EVAL", "return json.encode({1, 2, 3})", "0"],
                "[1,2,3]",
            ),
        ],
    );
}
